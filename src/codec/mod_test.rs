use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};

use super::*;

fn new_test_record(born_host: &str, store_host: &str) -> Result<MessageRecord> {
    let mut properties = BTreeMap::new();
    properties.insert(property::TAGS.to_string(), "TagA".to_string());
    properties.insert(property::KEYS.to_string(), "order-1001".to_string());
    let mut record = MessageRecord {
        queue_id: 3,
        flag: 7,
        queue_offset: 42,
        commit_log_offset: 4200,
        born_timestamp: 1_600_000_000_000,
        born_host: born_host.parse::<SocketAddr>().context("bad born host")?,
        store_timestamp: 1_600_000_000_500,
        store_host: store_host.parse::<SocketAddr>().context("bad store host")?,
        reconsume_times: 2,
        prepared_transaction_offset: 9,
        body: Bytes::from_static(b"hello delayed world"),
        topic: "orders".into(),
        properties,
        ..Default::default()
    };
    record.refresh_tags_code();
    Ok(record)
}

/// Fill in the fields which are derived during encoding.
fn expected_after_decode(record: &MessageRecord, encoded_len: usize, sys_flag: i32) -> MessageRecord {
    let mut expected = record.clone();
    expected.store_size = (encoded_len - TAGS_CODE_LEN) as i32;
    expected.body_crc = body_crc32(&record.body);
    expected.sys_flag = sys_flag;
    expected
}

#[test]
fn round_trip_ipv4_record() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let encoded = encode(&record)?;

    let mut buf = encoded.clone();
    let decoded = decode(&mut buf, None, true).context("expected record to decode")?;

    let expected = expected_after_decode(&record, encoded.len(), 0);
    assert_eq!(decoded, expected, "decoded record does not match the original");
    assert!(buf.is_empty(), "expected buffer to be fully consumed, {} bytes remain", buf.len());
    Ok(())
}

#[test]
fn round_trip_ipv6_record_sets_v6_flags() -> Result<()> {
    let record = new_test_record("[2001:db8::1]:5000", "[::1]:10911")?;
    let encoded = encode(&record)?;

    let mut buf = encoded.clone();
    let decoded = decode(&mut buf, None, true).context("expected record to decode")?;

    let v6_flags = sys_flag::BORNHOST_V6_FLAG | sys_flag::STOREHOSTADDRESS_V6_FLAG;
    assert!(decoded.sys_flag & v6_flags == v6_flags, "expected both v6 flags to be set, got sys flag {:#x}", decoded.sys_flag);
    let expected = expected_after_decode(&record, encoded.len(), v6_flags);
    assert_eq!(decoded, expected, "decoded record does not match the original");
    Ok(())
}

#[test]
fn round_trip_mixed_families_only_sets_matching_flag() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "[::1]:10911")?;
    let mut buf = encode(&record)?;
    let decoded = decode(&mut buf, None, true).context("expected record to decode")?;
    assert!(decoded.sys_flag & sys_flag::BORNHOST_V6_FLAG == 0, "expected born host v6 flag to be clear");
    assert!(decoded.sys_flag & sys_flag::STOREHOSTADDRESS_V6_FLAG != 0, "expected store host v6 flag to be set");
    assert_eq!(decoded.store_host, record.store_host, "store host mismatch");
    Ok(())
}

#[test]
fn cal_msg_length_matches_encoded_length() -> Result<()> {
    let cases = [
        ("10.0.0.1:5000", "10.0.0.2:10911", b"some body".to_vec(), true),
        ("[2001:db8::1]:5000", "[::1]:10911", b"some body".to_vec(), true),
        ("10.0.0.1:5000", "[::1]:10911", Vec::new(), false),
    ];
    for (born, store, body, with_props) in cases {
        let mut record = new_test_record(born, store)?;
        record.body = Bytes::from(body);
        if !with_props {
            record.properties.clear();
        }
        let encoded = encode(&record)?;
        let mut buf = encoded.clone();
        let decoded = decode(&mut buf, None, false).context("expected record to decode")?;
        let props_len = properties_to_string(&record.properties).len() as i32;
        let expected = cal_msg_length(decoded.sys_flag, record.body.len() as i32, record.topic.len() as i32, props_len);
        assert_eq!(expected as usize, encoded.len(), "cal_msg_length {} differs from encoded length {}", expected, encoded.len());
    }
    Ok(())
}

#[test]
fn decode_truncated_record_consumes_buffer() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let encoded = encode(&record)?;
    let mut buf = encoded.slice(..encoded.len() - 3);

    let decoded = decode(&mut buf, None, true);
    assert!(decoded.is_none(), "expected truncated record to fail decoding");
    assert!(buf.is_empty(), "expected cursor to be at the end of the buffer, {} bytes remain", buf.len());
    Ok(())
}

#[test]
fn decode_rejects_bad_magic() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let mut raw = BytesMut::from(&encode(&record)?[..]);
    raw[12..16].copy_from_slice(&0x0BADF00Di32.to_be_bytes());
    let mut buf = raw.freeze();
    assert!(decode(&mut buf, None, true).is_none(), "expected a record with a bad magic code to fail decoding");
    Ok(())
}

#[test]
fn decode_without_body_skips_it() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let mut buf = encode(&record)?;
    let decoded = decode(&mut buf, None, false).context("expected record to decode")?;
    assert!(decoded.body.is_empty(), "expected body to be skipped, got {} bytes", decoded.body.len());
    assert_eq!(decoded.topic, record.topic, "expected topic to still be decoded after skipping the body");
    assert_eq!(decoded.properties, record.properties, "expected properties to still be decoded after skipping the body");
    Ok(())
}

#[test]
fn concatenated_records_decode_in_sequence() -> Result<()> {
    let first = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let mut second = new_test_record("10.0.0.3:5000", "10.0.0.2:10911")?;
    second.topic = "payments".into();
    let mut raw = BytesMut::new();
    raw.put(encode(&first)?);
    raw.put(encode(&second)?);
    let mut buf = raw.freeze();

    let decoded_first = decode(&mut buf, None, true).context("expected first record")?;
    let decoded_second = decode(&mut buf, None, true).context("expected second record")?;
    assert_eq!(decoded_first.topic, "orders", "unexpected first topic {}", decoded_first.topic);
    assert_eq!(decoded_second.topic, "payments", "unexpected second topic {}", decoded_second.topic);
    assert!(buf.is_empty(), "expected both records to consume the buffer");
    Ok(())
}

#[test]
fn decode_with_log_position_derives_message_id() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let mut buf = encode(&record)?;
    let parts = MessageIdParts { ledger_id: 11, entry_id: 22, partition: 0, batch_index: 0 };
    let decoded = decode(&mut buf, Some(&parts), true).context("expected record to decode")?;

    let msg_id = decoded.msg_id.context("expected message id to be set")?;
    let id = decode_message_id(&msg_id)?;
    assert_eq!(id.ledger_id, 11, "unexpected ledger id {}", id.ledger_id);
    assert_eq!(id.entry_id, 22, "unexpected entry id {}", id.entry_id);
    assert_eq!(id.partition, 3, "expected partition to be the queue id, got {}", id.partition);
    assert_eq!(id.batch_index, -1, "expected batch index -1, got {}", id.batch_index);
    Ok(())
}

#[test]
fn message_id_round_trip() -> Result<()> {
    let msg_id = create_message_id(123456789, 987654321, 7, 4);
    assert_eq!(msg_id.len(), 56, "expected 56 hex chars, got {}", msg_id.len());
    assert!(msg_id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()), "expected uppercase hex, got {}", msg_id);

    let parts = decode_message_id(&msg_id)?;
    let expected = MessageIdParts { ledger_id: 123456789, entry_id: 987654321, partition: 7, batch_index: 4 };
    assert_eq!(parts, expected, "unexpected decoded message id parts");
    Ok(())
}

#[test]
fn message_id_rejects_malformed_input() {
    assert!(decode_message_id("ABC").is_err(), "expected short message id to be rejected");
    assert!(decode_message_id(&"ZZ".repeat(28)).is_err(), "expected non-hex message id to be rejected");
}

#[test]
fn properties_drop_empty_pairs() {
    let mut properties = BTreeMap::new();
    properties.insert("a".to_string(), "1".to_string());
    properties.insert("b".to_string(), String::new());
    properties.insert(String::new(), "3".to_string());
    let rendered = properties_to_string(&properties);
    assert_eq!(rendered, "a\u{1}1\u{2}", "unexpected rendered properties {:?}", rendered);

    let parsed = string_to_properties("a\u{1}1\u{2}b\u{1}\u{2}junk\u{2}c\u{1}3\u{2}");
    assert_eq!(parsed.len(), 2, "expected 2 valid pairs, got {:?}", parsed);
    assert_eq!(parsed.get("c").map(String::as_str), Some("3"), "expected pair c=3, got {:?}", parsed);
}

#[test]
fn tags_code_uses_string_hash() {
    assert_eq!(tags_string_to_tags_code(""), 0, "expected empty tags to hash to 0");
    assert_eq!(tags_string_to_tags_code("a"), 97, "unexpected tags code for 'a'");
    assert_eq!(tags_string_to_tags_code("ab"), 3105, "unexpected tags code for 'ab'");
    // Overflowing hashes wrap and are sign extended.
    let code = tags_string_to_tags_code("polygenelubricants");
    assert_eq!(code, i32::MIN as i64, "expected wrapped hash, got {}", code);
}

#[test]
fn strip_and_peek_tags_code() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let encoded = encode(&record)?;
    assert_eq!(peek_tags_code(&encoded), Some(record.tags_code), "unexpected peeked tags code");

    let stripped = strip_tags_code(&encoded);
    assert_eq!(stripped.len(), encoded.len() - TAGS_CODE_LEN, "unexpected stripped length {}", stripped.len());
    let total_size = i32::from_be_bytes([stripped[0], stripped[1], stripped[2], stripped[3]]);
    assert_eq!(total_size as usize, stripped.len(), "expected total size to describe the stripped record, got {}", total_size);
    Ok(())
}

#[test]
fn stamp_queue_offset_rewrites_only_records() -> Result<()> {
    let record = new_test_record("10.0.0.1:5000", "10.0.0.2:10911")?;
    let mut stored = encode(&record)?.to_vec();
    assert!(stamp_queue_offset(&mut stored, 77), "expected a record to be stamped");

    let mut buf = Bytes::from(stored);
    let decoded = decode(&mut buf, None, true).context("expected stamped record to decode")?;
    assert_eq!(decoded.queue_offset, 77, "expected queue offset 77, got {}", decoded.queue_offset);
    assert_eq!(decoded.body, record.body, "expected body to be untouched by stamping");

    let mut garbage = b"not a record at all, not even close".to_vec();
    let before = garbage.clone();
    assert!(!stamp_queue_offset(&mut garbage, 77), "expected non-records to be left alone");
    assert_eq!(garbage, before, "expected non-record bytes to be unchanged");
    Ok(())
}
