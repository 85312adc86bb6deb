//! Remoting command framing.
//!
//! Every command travels as a single length prefixed frame:
//!
//! ```text
//! total length(4) | serialize type(1) + header length(3) | json header | body
//! ```
//!
//! The total length counts everything after itself. Only the JSON header serialization is
//! supported.


use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::AppError;

/// Request codes understood by this broker.
pub mod request_code {
    pub const SEND_MESSAGE: i32 = 10;
    pub const PULL_MESSAGE: i32 = 11;
    pub const QUERY_MESSAGE: i32 = 12;
    pub const QUERY_CONSUMER_OFFSET: i32 = 14;
    pub const UPDATE_CONSUMER_OFFSET: i32 = 15;
    pub const VIEW_MESSAGE_BY_ID: i32 = 33;
    pub const HEART_BEAT: i32 = 34;
    pub const UNREGISTER_CLIENT: i32 = 35;
    pub const CONSUMER_SEND_MSG_BACK: i32 = 36;
    pub const END_TRANSACTION: i32 = 37;
    pub const GET_CONSUMER_LIST_BY_GROUP: i32 = 38;
    pub const CHECK_CLIENT_CONFIG: i32 = 46;
    pub const SEND_MESSAGE_V2: i32 = 310;
    pub const SEND_BATCH_MESSAGE: i32 = 320;
}

/// Response codes returned by this broker.
pub mod response_code {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
    pub const PULL_NOT_FOUND: i32 = 19;
    pub const PULL_RETRY_IMMEDIATELY: i32 = 20;
    pub const PULL_OFFSET_MOVED: i32 = 21;
    pub const QUERY_NOT_FOUND: i32 = 22;
}

/// Flag bit marking a command as a response.
pub const FLAG_RESPONSE: i32 = 0x1;
/// Flag bit marking a request as oneway, it is never answered.
pub const FLAG_ONEWAY: i32 = 0x1 << 1;
/// The max accepted frame length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// The serialize type of JSON encoded headers.
const SERIALIZE_TYPE_JSON: u8 = 0;
/// The max header length encodable in the 24 bit length field.
const MAX_HEADER_LEN: usize = 0xFF_FFFF;
/// The language stamped on commands created by this broker.
const LANGUAGE: &str = "JAVA";

static NEXT_OPAQUE: AtomicI32 = AtomicI32::new(0);

/// The body of a remoting command.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    /// A single contiguous body.
    Inline(Bytes),
    /// A body made up of many stored records, written back to back without being copied.
    Records(Vec<Bytes>),
}

impl Payload {
    /// The total length of this payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Inline(body) => body.len(),
            Payload::Records(records) => records.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The chunks of this payload, in the order they are written.
    pub fn chunks(&self) -> Vec<Bytes> {
        match self {
            Payload::Empty => vec![],
            Payload::Inline(body) => vec![body.clone()],
            Payload::Records(records) => records.clone(),
        }
    }
}

/// The JSON header of a remoting frame.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandHeader {
    code: i32,
    #[serde(default)]
    language: String,
    #[serde(default)]
    version: i32,
    #[serde(default)]
    opaque: i32,
    #[serde(default)]
    flag: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    ext_fields: HashMap<String, String>,
}

/// A request or response of the remoting protocol.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemotingCommand {
    pub code: i32,
    pub language: String,
    pub version: i32,
    /// Correlates a response with its request.
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    /// The custom header fields of the command.
    pub ext_fields: HashMap<String, String>,
    pub body: Payload,
}

impl RemotingCommand {
    /// Create a new request with a fresh opaque.
    pub fn new_request(code: i32) -> Self {
        Self {
            code,
            language: LANGUAGE.into(),
            opaque: NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Create a new response to the request with the given opaque.
    pub fn new_response(code: i32, opaque: i32, remark: Option<String>) -> Self {
        Self {
            code,
            language: LANGUAGE.into(),
            opaque,
            flag: FLAG_RESPONSE,
            remark,
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flag & FLAG_RESPONSE != 0
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & FLAG_ONEWAY != 0
    }

    /// Mark this command as the response to the request with the given opaque.
    pub fn mark_response(&mut self, opaque: i32) {
        self.opaque = opaque;
        self.flag |= FLAG_RESPONSE;
    }

    /// Get the given custom header field.
    pub fn ext(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    /// Parse the given custom header field, which must be present.
    pub fn ext_required<T: FromStr>(&self, key: &str) -> Result<T, AppError> {
        let raw = self
            .ext(key)
            .ok_or_else(|| AppError::InvalidInput(format!("the custom header field {} is missing", key)))?;
        raw.parse()
            .map_err(|_| AppError::InvalidInput(format!("the custom header field {} has an invalid value {}", key, raw)))
    }

    /// Parse the given custom header field, falling back to `default` when absent.
    pub fn ext_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match self.ext(key) {
            Some(_) => self.ext_required(key),
            None => Ok(default),
        }
    }

    /// Set the given custom header field.
    pub fn set_ext(&mut self, key: &str, val: impl ToString) {
        self.ext_fields.insert(key.to_string(), val.to_string());
    }

    pub fn with_ext(mut self, key: &str, val: impl ToString) -> Self {
        self.set_ext(key, val);
        self
    }

    pub fn with_body(mut self, body: Payload) -> Self {
        self.body = body;
        self
    }

    /// The body of this command as a single buffer.
    pub fn inline_body(&self) -> Bytes {
        match &self.body {
            Payload::Empty => Bytes::new(),
            Payload::Inline(body) => body.clone(),
            Payload::Records(records) => records.iter().fold(BytesMut::new(), |mut buf, record| {
                buf.put_slice(record);
                buf
            }).freeze(),
        }
    }

    fn header(&self) -> CommandHeader {
        CommandHeader {
            code: self.code,
            language: self.language.clone(),
            version: self.version,
            opaque: self.opaque,
            flag: self.flag,
            remark: self.remark.clone(),
            ext_fields: self.ext_fields.clone(),
        }
    }
}

/// The codec of remoting frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemotingCodec;

impl RemotingCodec {
    /// Encode the frame prefix of the given command, which is everything but its body.
    ///
    /// The body must be written directly after the prefix, see `Payload::chunks`.
    pub fn encode_header(cmd: &RemotingCommand) -> Result<Bytes> {
        let header = serde_json::to_vec(&cmd.header()).context("error serializing remoting header")?;
        if header.len() > MAX_HEADER_LEN {
            bail!("remoting header length {} exceeds {}", header.len(), MAX_HEADER_LEN);
        }
        let total = 4 + header.len() + cmd.body.len();
        if total > MAX_FRAME_LEN {
            bail!("remoting frame length {} exceeds {}", total, MAX_FRAME_LEN);
        }
        let mut buf = BytesMut::with_capacity(8 + header.len());
        buf.put_u32(total as u32);
        buf.put_u32(((SERIALIZE_TYPE_JSON as u32) << 24) | header.len() as u32);
        buf.put_slice(&header);
        Ok(buf.freeze())
    }
}

impl Decoder for RemotingCodec {
    type Item = RemotingCommand;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(4..=MAX_FRAME_LEN).contains(&total) {
            bail!("invalid remoting frame length {}", total);
        }
        if src.len() < 4 + total {
            src.reserve(4 + total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + total).freeze();
        frame.advance(4);
        let mark = frame.get_u32();
        let serialize_type = (mark >> 24) as u8;
        let header_len = (mark & MAX_HEADER_LEN as u32) as usize;
        if serialize_type != SERIALIZE_TYPE_JSON {
            bail!("unsupported remoting serialize type {}", serialize_type);
        }
        if header_len > frame.remaining() {
            bail!("remoting header length {} exceeds frame remainder {}", header_len, frame.remaining());
        }
        let header: CommandHeader = serde_json::from_slice(&frame[..header_len]).context("error deserializing remoting header")?;
        frame.advance(header_len);

        Ok(Some(RemotingCommand {
            code: header.code,
            language: header.language,
            version: header.version,
            opaque: header.opaque,
            flag: header.flag,
            remark: header.remark,
            ext_fields: header.ext_fields,
            body: if frame.is_empty() { Payload::Empty } else { Payload::Inline(frame) },
        }))
    }
}

impl Encoder<RemotingCommand> for RemotingCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, cmd: RemotingCommand, dst: &mut BytesMut) -> Result<()> {
        let prefix = Self::encode_header(&cmd)?;
        dst.reserve(prefix.len() + cmd.body.len());
        dst.put_slice(&prefix);
        for chunk in cmd.body.chunks() {
            dst.put_slice(&chunk);
        }
        Ok(())
    }
}
