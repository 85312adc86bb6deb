use anyhow::{bail, Context, Result};

/// The byte length of a packed message id.
const MESSAGE_ID_LEN: usize = 28;

/// The log position a message id is derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageIdParts {
    pub ledger_id: i64,
    pub entry_id: i64,
    pub partition: i64,
    pub batch_index: i32,
}

/// Pack a log position into a message id, rendered as 56 uppercase hex characters.
pub fn create_message_id(ledger_id: i64, entry_id: i64, partition: i64, batch_index: i32) -> String {
    let mut raw = [0u8; MESSAGE_ID_LEN];
    raw[0..8].copy_from_slice(&ledger_id.to_be_bytes());
    raw[8..16].copy_from_slice(&entry_id.to_be_bytes());
    raw[16..24].copy_from_slice(&partition.to_be_bytes());
    raw[24..28].copy_from_slice(&batch_index.to_be_bytes());
    raw.iter().map(|byte| format!("{:02X}", byte)).collect()
}

/// Unpack a message id created by `create_message_id`.
pub fn decode_message_id(msg_id: &str) -> Result<MessageIdParts> {
    if msg_id.len() != MESSAGE_ID_LEN * 2 || !msg_id.is_ascii() {
        bail!("invalid message id {:?}, expected {} hex chars", msg_id, MESSAGE_ID_LEN * 2);
    }
    let mut raw = [0u8; MESSAGE_ID_LEN];
    for (idx, byte) in raw.iter_mut().enumerate() {
        let pair = &msg_id[idx * 2..idx * 2 + 2];
        *byte = u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex pair {:?} in message id", pair))?;
    }
    let read_i64 = |start: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[start..start + 8]);
        i64::from_be_bytes(buf)
    };
    Ok(MessageIdParts {
        ledger_id: read_i64(0),
        entry_id: read_i64(8),
        partition: read_i64(16),
        batch_index: i32::from_be_bytes([raw[24], raw[25], raw[26], raw[27]]),
    })
}
