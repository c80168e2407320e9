//! DDS retrieval protocol: frame codec and the session client.

pub mod client;
pub mod frame;

pub use client::{
    ClientState, ConnectResult, PullOutcome, PullResult, PushResult, RetrievalClient,
    RetrievalClientConfig,
};
pub use frame::{END_OF_WINDOW, Frame, FrameError, MessageType, ServerReply};

/// Transport and protocol failures of a [`RetrievalClient`].
#[derive(Debug, thiserror::Error)]
pub enum DdsError {
    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },
    #[error("server error {code} (errno {errno}): {message}")]
    Server {
        code: i32,
        errno: i32,
        message: String,
    },
    #[error("read from archive timed out")]
    ReadTimeout,
    #[error("write to archive timed out")]
    WriteTimeout,
    #[error("archive closed the connection")]
    Disconnected,
    #[error("frame of {len} bytes exceeds the protocol limit")]
    FrameTooLarge { len: usize },
    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used when mapping to caller-visible errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdsErrorKind {
    /// Endpoint unreachable, refused or unresolvable.
    Connect,
    /// Garbled or out-of-sequence exchange.
    Protocol,
    /// The archive explicitly rejected the request.
    Server,
    /// Transport severed or stalled mid-exchange.
    Io,
}

impl DdsError {
    #[must_use]
    pub fn kind(&self) -> DdsErrorKind {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } => DdsErrorKind::Connect,
            Self::Protocol(_)
            | Self::UnexpectedResponse { .. }
            | Self::FrameTooLarge { .. }
            | Self::InvalidState { .. } => DdsErrorKind::Protocol,
            Self::Server { .. } => DdsErrorKind::Server,
            Self::ReadTimeout | Self::WriteTimeout | Self::Disconnected | Self::Io(_) => {
                DdsErrorKind::Io
            }
        }
    }

    /// True for the graceful "until time reached" reply.
    #[must_use]
    pub fn is_end_of_window(&self) -> bool {
        matches!(self, Self::Server { code, .. } if *code == END_OF_WINDOW)
    }
}

impl From<FrameError> for DdsError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { len } => Self::FrameTooLarge { len },
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ServerReply> for DdsError {
    fn from(reply: ServerReply) -> Self {
        Self::Server {
            code: reply.code,
            errno: reply.errno,
            message: reply.message,
        }
    }
}
