//! Wire message codec.
//!
//! Records are stored in the underlying log in the queue protocol's native stored layout,
//! prefixed by an 8 byte tags code so that tag filtering can be performed without decoding the
//! full record. All integers are big-endian.
//!
//! ```text
//! tags code(8) | total size(4) | magic(4) | body crc(4) | queue id(4) | flag(4)
//! queue offset(8) | commit offset(8) | sys flag(4) | born ts(8) | born host(4|16 + 4)
//! store ts(8) | store host(4|16 + 4) | reconsume times(4) | prepared tx offset(8)
//! body len(4) + body | topic len(1) + topic | properties len(2) + properties
//! ```

mod msgid;
#[cfg(test)]
mod mod_test;
mod properties;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::AppError;

pub use msgid::{create_message_id, decode_message_id, MessageIdParts};
pub use properties::{properties_to_string, string_to_properties, NAME_VALUE_SEPARATOR, PROPERTY_SEPARATOR};

/// The magic code written into every stored record.
pub const MESSAGE_MAGIC_CODE: i32 = 0xDAA320A7_u32 as i32;
/// The length of the tags code prefix carried by every stored record.
pub const TAGS_CODE_LEN: usize = 8;

/// Message system flags.
pub mod sys_flag {
    pub const COMPRESSED_FLAG: i32 = 0x1;
    pub const MULTI_TAGS_FLAG: i32 = 0x1 << 1;
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;
    pub const BORNHOST_V6_FLAG: i32 = 0x1 << 4;
    pub const STOREHOSTADDRESS_V6_FLAG: i32 = 0x1 << 5;
}

/// Reserved message property keys.
pub mod property {
    pub const KEYS: &str = "KEYS";
    pub const TAGS: &str = "TAGS";
    pub const DELAY_TIME_LEVEL: &str = "DELAY";
    pub const REAL_TOPIC: &str = "REAL_TOPIC";
    pub const REAL_QUEUE_ID: &str = "REAL_QID";
    pub const TRANSACTION_PREPARED: &str = "TRAN_MSG";
    pub const UNIQ_CLIENT_MESSAGE_ID_KEYIDX: &str = "UNIQ_KEY";
}

/// A message record as carried by the queue protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRecord {
    pub tags_code: i64,
    /// The client visible record length, as read from a decoded record.
    pub store_size: i32,
    pub body_crc: i32,
    pub queue_id: i32,
    pub flag: i32,
    pub queue_offset: i64,
    pub commit_log_offset: i64,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub born_host: SocketAddr,
    pub store_timestamp: i64,
    pub store_host: SocketAddr,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
    pub body: Bytes,
    pub topic: String,
    pub properties: BTreeMap<String, String>,
    /// The message id, only populated when decoded with a known log position.
    pub msg_id: Option<String>,
}

impl Default for MessageRecord {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            tags_code: 0,
            store_size: 0,
            body_crc: 0,
            queue_id: 0,
            flag: 0,
            queue_offset: 0,
            commit_log_offset: 0,
            sys_flag: 0,
            born_timestamp: 0,
            born_host: unspecified,
            store_timestamp: 0,
            store_host: unspecified,
            reconsume_times: 0,
            prepared_transaction_offset: 0,
            body: Bytes::new(),
            topic: String::new(),
            properties: BTreeMap::new(),
            msg_id: None,
        }
    }
}

impl MessageRecord {
    /// The value of the `TAGS` property, if any.
    pub fn tags(&self) -> Option<&str> {
        self.properties.get(property::TAGS).map(|val| val.as_str())
    }

    /// The delay level requested by this message, if any.
    pub fn delay_level(&self) -> Option<i32> {
        self.properties
            .get(property::DELAY_TIME_LEVEL)
            .and_then(|val| val.parse::<i32>().ok())
            .filter(|level| *level > 0)
    }

    /// Recompute the tags code from the current `TAGS` property.
    pub fn refresh_tags_code(&mut self) {
        self.tags_code = self.tags().map(tags_string_to_tags_code).unwrap_or(0);
    }
}

/// Compute the tags code of the given tags string.
///
/// This is the 32-bit string hash used by queue protocol clients, computed over UTF-16 code
/// units and sign extended.
pub fn tags_string_to_tags_code(tags: &str) -> i64 {
    if tags.is_empty() {
        return 0;
    }
    let hash = tags.encode_utf16().fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32));
    hash as i64
}

/// Compute the encoded length of a record, including its tags code prefix.
pub fn cal_msg_length(sys_flag: i32, body_len: i32, topic_len: i32, properties_len: i32) -> i32 {
    let bornhost_len = if sys_flag & sys_flag::BORNHOST_V6_FLAG == 0 { 8 } else { 20 };
    let storehost_len = if sys_flag & sys_flag::STOREHOSTADDRESS_V6_FLAG == 0 { 8 } else { 20 };
    8 // tags code
        + 4 // total size
        + 4 // magic code
        + 4 // body crc
        + 4 // queue id
        + 4 // flag
        + 8 // queue offset
        + 8 // physical offset
        + 4 // sys flag
        + 8 // born timestamp
        + bornhost_len
        + 8 // store timestamp
        + storehost_len
        + 4 // reconsume times
        + 8 // prepared transaction offset
        + 4 + body_len.max(0)
        + 1 + topic_len
        + 2 + properties_len.max(0)
}

/// The IEEE CRC32 of the given body, masked to a non-negative i32.
pub fn body_crc32(body: &[u8]) -> i32 {
    (crc32fast::hash(body) & 0x7FFF_FFFF) as i32
}

/// Encode the given record into its stored layout.
///
/// The v6 bits of the encoded sys flag always follow the address families of the record's
/// born and store hosts.
pub fn encode(record: &MessageRecord) -> Result<Bytes, AppError> {
    let topic = record.topic.as_bytes();
    if topic.len() > i8::MAX as usize {
        return Err(AppError::InvalidInput(format!("topic length {} exceeds {}", topic.len(), i8::MAX)));
    }
    let properties = properties_to_string(&record.properties);
    if properties.len() > i16::MAX as usize {
        return Err(AppError::InvalidInput(format!("properties length {} exceeds {}", properties.len(), i16::MAX)));
    }

    let mut sys_flag = record.sys_flag & !(sys_flag::BORNHOST_V6_FLAG | sys_flag::STOREHOSTADDRESS_V6_FLAG);
    if record.born_host.is_ipv6() {
        sys_flag |= sys_flag::BORNHOST_V6_FLAG;
    }
    if record.store_host.is_ipv6() {
        sys_flag |= sys_flag::STOREHOSTADDRESS_V6_FLAG;
    }

    let msg_len = cal_msg_length(sys_flag, record.body.len() as i32, topic.len() as i32, properties.len() as i32);
    let mut buf = BytesMut::with_capacity(msg_len as usize);
    buf.put_i64(record.tags_code);
    buf.put_i32(msg_len - TAGS_CODE_LEN as i32);
    buf.put_i32(MESSAGE_MAGIC_CODE);
    buf.put_i32(body_crc32(&record.body));
    buf.put_i32(record.queue_id);
    buf.put_i32(record.flag);
    buf.put_i64(record.queue_offset);
    buf.put_i64(record.commit_log_offset);
    buf.put_i32(sys_flag);
    buf.put_i64(record.born_timestamp);
    put_socket_addr(&mut buf, &record.born_host);
    buf.put_i64(record.store_timestamp);
    put_socket_addr(&mut buf, &record.store_host);
    buf.put_i32(record.reconsume_times);
    buf.put_i64(record.prepared_transaction_offset);
    buf.put_i32(record.body.len() as i32);
    buf.put_slice(&record.body);
    buf.put_u8(topic.len() as u8);
    buf.put_slice(topic);
    buf.put_i16(properties.len() as i16);
    buf.put_slice(properties.as_bytes());
    Ok(buf.freeze())
}

/// Decode a stored record from the front of the given buffer.
///
/// On any structural failure `None` is returned and the buffer is fully consumed. When
/// `msg_id` is given, the decoded record's message id is derived from it and the queue id.
pub fn decode(buf: &mut Bytes, msg_id: Option<&MessageIdParts>, read_body: bool) -> Option<MessageRecord> {
    match try_decode(buf, msg_id, read_body) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::debug!(error = ?err, "error decoding message record");
            buf.advance(buf.remaining());
            None
        }
    }
}

/// Strip the tags code prefix from a stored record, yielding the client visible record.
pub fn strip_tags_code(stored: &Bytes) -> Bytes {
    if stored.len() < TAGS_CODE_LEN {
        return Bytes::new();
    }
    stored.slice(TAGS_CODE_LEN..)
}

/// Overwrite the queue offset of a stored record in place.
///
/// Returns `false`, leaving `stored` untouched, if it does not hold a record.
pub fn stamp_queue_offset(stored: &mut [u8], queue_offset: i64) -> bool {
    const MAGIC_POSITION: usize = TAGS_CODE_LEN + 4;
    const QUEUE_OFFSET_POSITION: usize = TAGS_CODE_LEN + 20;
    match stored.get(MAGIC_POSITION..MAGIC_POSITION + 4) {
        Some(magic) if magic == MESSAGE_MAGIC_CODE.to_be_bytes() => (),
        _ => return false,
    }
    match stored.get_mut(QUEUE_OFFSET_POSITION..QUEUE_OFFSET_POSITION + 8) {
        Some(slot) => {
            slot.copy_from_slice(&queue_offset.to_be_bytes());
            true
        }
        None => false,
    }
}

/// Read the tags code prefix of a stored record without decoding it.
pub fn peek_tags_code(stored: &[u8]) -> Option<i64> {
    let prefix: [u8; TAGS_CODE_LEN] = stored.get(..TAGS_CODE_LEN)?.try_into().ok()?;
    Some(i64::from_be_bytes(prefix))
}

fn try_decode(buf: &mut Bytes, msg_id: Option<&MessageIdParts>, read_body: bool) -> Result<MessageRecord> {
    let mut record = MessageRecord::default();
    ensure_remaining(buf, 8 + 4 + 4 + 4 + 4 + 4 + 8 + 8 + 4 + 8)?;
    record.tags_code = buf.get_i64();
    record.store_size = buf.get_i32();
    let magic = buf.get_i32();
    if magic != MESSAGE_MAGIC_CODE {
        bail!("invalid magic code {:#x}", magic);
    }
    record.body_crc = buf.get_i32();
    record.queue_id = buf.get_i32();
    record.flag = buf.get_i32();
    record.queue_offset = buf.get_i64();
    record.commit_log_offset = buf.get_i64();
    record.sys_flag = buf.get_i32();
    record.born_timestamp = buf.get_i64();
    record.born_host = get_socket_addr(buf, record.sys_flag & sys_flag::BORNHOST_V6_FLAG != 0)?;
    ensure_remaining(buf, 8)?;
    record.store_timestamp = buf.get_i64();
    record.store_host = get_socket_addr(buf, record.sys_flag & sys_flag::STOREHOSTADDRESS_V6_FLAG != 0)?;

    ensure_remaining(buf, 4 + 8 + 4)?;
    record.reconsume_times = buf.get_i32();
    record.prepared_transaction_offset = buf.get_i64();
    let body_len = buf.get_i32();
    if body_len > 0 {
        let body_len = body_len as usize;
        ensure_remaining(buf, body_len)?;
        if read_body {
            record.body = buf.split_to(body_len);
        } else {
            buf.advance(body_len);
        }
    }

    ensure_remaining(buf, 1)?;
    let topic_len = buf.get_i8();
    if topic_len < 0 {
        bail!("invalid topic length {}", topic_len);
    }
    let topic_len = topic_len as usize;
    ensure_remaining(buf, topic_len)?;
    record.topic = String::from_utf8(buf.split_to(topic_len).to_vec())?;

    ensure_remaining(buf, 2)?;
    let properties_len = buf.get_i16();
    if properties_len > 0 {
        let properties_len = properties_len as usize;
        ensure_remaining(buf, properties_len)?;
        let raw = buf.split_to(properties_len);
        record.properties = string_to_properties(std::str::from_utf8(&raw)?);
    }

    if let Some(parts) = msg_id {
        record.msg_id = Some(create_message_id(parts.ledger_id, parts.entry_id, record.queue_id as i64, -1));
    }
    Ok(record)
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        bail!("buffer underflow, needed {} bytes but only {} remain", needed, buf.remaining());
    }
    Ok(())
}

fn put_socket_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
    buf.put_i32(addr.port() as i32);
}

fn get_socket_addr(buf: &mut Bytes, is_v6: bool) -> Result<SocketAddr> {
    let ip = if is_v6 {
        ensure_remaining(buf, 16 + 4)?;
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        ensure_remaining(buf, 4 + 4)?;
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        IpAddr::V4(Ipv4Addr::from(octets))
    };
    let port = buf.get_i32();
    if !(0..=u16::MAX as i32).contains(&port) {
        bail!("invalid port {}", port);
    }
    Ok(SocketAddr::new(ip, port as u16))
}
