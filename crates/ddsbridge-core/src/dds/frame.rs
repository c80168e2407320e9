//! DDS frame codec.
//!
//! Every message is a 10-byte header followed by a body:
//!
//! ```text
//! +------+------+-------------+----------------+
//! | FAF0 | type | len (5 dec) | body (len)     |
//! +------+------+-------------+----------------+
//! ```
//!
//! A server-side failure is reported in a frame of the request's type whose
//! body starts with `?`, followed by `code,errno,message`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub const SYNC: &[u8; 4] = b"FAF0";
pub const HEADER_LEN: usize = 10;
pub const MAX_BODY_LEN: usize = 99_999;

/// Server code meaning "until time reached": the window is drained.
pub const END_OF_WINDOW: i32 = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    AuthHello,
    Goodbye,
    Status,
    Criteria,
    PutNetlist,
    MessageBlockExt,
}

impl MessageType {
    pub const ALL: [Self; 7] = [
        Self::Hello,
        Self::AuthHello,
        Self::Goodbye,
        Self::Status,
        Self::Criteria,
        Self::PutNetlist,
        Self::MessageBlockExt,
    ];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Hello => b'a',
            Self::AuthHello => b'm',
            Self::Goodbye => b'b',
            Self::Status => b'c',
            Self::Criteria => b'g',
            Self::PutNetlist => b'j',
            Self::MessageBlockExt => b'r',
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "Hello",
            Self::AuthHello => "AuthHello",
            Self::Goodbye => "Goodbye",
            Self::Status => "Status",
            Self::Criteria => "Criteria",
            Self::PutNetlist => "PutNetlist",
            Self::MessageBlockExt => "MessageBlockExt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad sync bytes {0:?}")]
    BadSync(Vec<u8>),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed length field {0:?}")]
    BadLength(String),
    #[error("frame body of {len} bytes exceeds {MAX_BODY_LEN}")]
    TooLarge { len: usize },
    #[error("malformed server error body: {0}")]
    BadServerError(String),
    #[error("body is not valid JSON: {0}")]
    Json(String),
}

/// A `?code,errno,message` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    pub code: i32,
    pub errno: i32,
    pub message: String,
}

impl ServerReply {
    #[must_use]
    pub fn is_end_of_window(&self) -> bool {
        self.code == END_OF_WINDOW
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(msg_type: MessageType, value: &T) -> Result<Self, FrameError> {
        let body = serde_json::to_vec(value).map_err(|e| FrameError::Json(e.to_string()))?;
        Ok(Self::new(msg_type, body))
    }

    pub fn server_error(msg_type: MessageType, reply: &ServerReply) -> Self {
        Self::new(
            msg_type,
            format!("?{},{},{}", reply.code, reply.errno, reply.message),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(FrameError::TooLarge {
                len: self.body.len(),
            });
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(SYNC);
        out.push(self.msg_type.code());
        out.extend_from_slice(format!("{:05}", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Parse the body as a server error, if it is one.
    pub fn as_server_error(&self) -> Result<Option<ServerReply>, FrameError> {
        let Some(rest) = self.body.strip_prefix(b"?") else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(rest);
        let mut parts = text.splitn(3, ',');
        let mut number = |field: &str| -> Result<i32, FrameError> {
            parts
                .next()
                .map(str::trim)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| FrameError::BadServerError(format!("{field} in {text:?}")))
        };
        let code = number("code")?;
        let errno = number("errno")?;
        let message = parts.next().unwrap_or_default().trim().to_string();
        Ok(Some(ServerReply {
            code,
            errno,
            message,
        }))
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_slice(&self.body).map_err(|e| FrameError::Json(e.to_string()))
    }

    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Pull one frame off the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are drained.
pub fn decode_from_buffer(buffer: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
    let sync_len = buffer.len().min(SYNC.len());
    if buffer[..sync_len] != SYNC[..sync_len] {
        return Err(FrameError::BadSync(buffer[..sync_len].to_vec()));
    }
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }

    let code = buffer[4];
    let msg_type = MessageType::from_code(code).ok_or(FrameError::UnknownType(code))?;

    let len_field = &buffer[5..HEADER_LEN];
    if !len_field.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::BadLength(
            String::from_utf8_lossy(len_field).into_owned(),
        ));
    }
    let body_len = len_field
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));

    if buffer.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    let body = buffer[HEADER_LEN..HEADER_LEN + body_len].to_vec();
    buffer.drain(..HEADER_LEN + body_len);
    Ok(Some(Frame { msg_type, body }))
}

/// Body of an authenticated hello: `username unix_secs authenticator`.
///
/// The authenticator is `hex(sha256(username ‖ hex(sha256(password)) ‖ unix_secs))`.
#[must_use]
pub fn auth_hello_body(username: &str, password: &str, unix_secs: i64) -> String {
    let password_hash = hex::encode(Sha256::digest(password.as_bytes()));
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(password_hash.as_bytes());
    hasher.update(unix_secs.to_string().as_bytes());
    let authenticator = hex::encode(hasher.finalize());
    format!("{username} {unix_secs} {authenticator}")
}
