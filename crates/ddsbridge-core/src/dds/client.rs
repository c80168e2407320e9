use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::DdsError;
use super::frame::{self, Frame, MessageType};
use crate::config::GatewayConfig;
use crate::model::{ArchiveStatus, NetworkList, RawMessage, RawMessageBlock, SearchCriteria};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PULL_GRACE_MS: u64 = 5_000;
const DEFAULT_GOODBYE_TIMEOUT_MS: u64 = 1_000;
const READ_CHUNK: usize = 4096;

pub type ConnectResult = Result<RetrievalClient, DdsError>;
pub type PushResult = Result<(), DdsError>;
pub type PullResult = Result<PullOutcome, DdsError>;

#[derive(Debug, Clone)]
pub struct RetrievalClientConfig {
    pub connect_timeout: Duration,
    /// Bound on every non-pull exchange.
    pub io_timeout: Duration,
    /// Extra read allowance on top of a pull's own timeout.
    pub pull_grace: Duration,
    pub goodbye_timeout: Duration,
}

impl RetrievalClientConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            ..Self::default()
        }
    }
}

impl Default for RetrievalClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            pull_grace: Duration::from_millis(DEFAULT_PULL_GRACE_MS),
            goodbye_timeout: Duration::from_millis(DEFAULT_GOODBYE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    Authenticated,
    Retrieving,
    /// The archive reported the window drained. Terminal.
    Exhausted,
    /// An exchange failed. Terminal.
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Retrieving => "retrieving",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of one successful pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// More blocks may follow.
    Block(RawMessageBlock),
    /// The window is drained; carries any messages delivered with the final reply.
    Exhausted(RawMessageBlock),
}

impl PullOutcome {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    #[must_use]
    pub fn into_block(self) -> RawMessageBlock {
        match self {
            Self::Block(block) | Self::Exhausted(block) => block,
        }
    }
}

#[derive(Serialize)]
struct BlockRequest {
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct BlockReply {
    #[serde(default)]
    messages: Vec<RawMessage>,
    more_to_follow: bool,
}

/// One stateful connection to a DDS archive.
///
/// Drive it in order: [`connect`](Self::connect),
/// [`authenticate`](Self::authenticate), any number of
/// [`push_netlist`](Self::push_netlist), [`push_criteria`](Self::push_criteria),
/// then [`pull_block`](Self::pull_block) until exhausted. Any failed exchange
/// leaves the client in [`ClientState::Failed`].
pub struct RetrievalClient {
    stream: TcpStream,
    host: String,
    port: u16,
    state: ClientState,
    read_buf: Vec<u8>,
    config: RetrievalClientConfig,
}

impl fmt::Debug for RetrievalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl RetrievalClient {
    pub async fn connect(host: &str, port: u16, config: RetrievalClientConfig) -> ConnectResult {
        let stream = timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DdsError::ConnectTimeout {
                host: host.to_string(),
                port,
            })?
            .map_err(|source| DdsError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(host, port, error = %err, "set_nodelay failed");
        }
        tracing::debug!(host, port, "Connected to archive");

        Ok(Self {
            stream,
            host: host.to_string(),
            port,
            state: ClientState::Connected,
            read_buf: Vec::new(),
            config,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Plain hello without a password, authenticated hello with one.
    pub async fn authenticate(&mut self, username: &str, password: Option<&str>) -> PushResult {
        self.require("authenticate", &[ClientState::Connected])?;
        let request = match password {
            None => Frame::new(MessageType::Hello, username),
            Some(password) => Frame::new(
                MessageType::AuthHello,
                frame::auth_hello_body(username, password, chrono::Utc::now().timestamp()),
            ),
        };
        let result = self.transact(request, self.config.io_timeout).await;
        if result.is_ok() {
            tracing::debug!(host = %self.host, username, authenticated = password.is_some(), "Hello accepted");
        }
        self.settle(result.map(drop), ClientState::Authenticated)
    }

    pub async fn push_netlist(&mut self, list: &NetworkList) -> PushResult {
        self.require("push_netlist", &[ClientState::Authenticated])?;
        let result = self
            .exchange_json(MessageType::PutNetlist, list, self.config.io_timeout)
            .await;
        self.settle(result.map(drop), ClientState::Authenticated)
    }

    pub async fn push_criteria(&mut self, criteria: &SearchCriteria) -> PushResult {
        self.require("push_criteria", &[ClientState::Authenticated])?;
        let result = self
            .exchange_json(MessageType::Criteria, criteria, self.config.io_timeout)
            .await;
        self.settle(result.map(drop), ClientState::Retrieving)
    }

    /// Pull the next block, letting the archive wait up to `wait` for data.
    ///
    /// "Until time reached" and a reply with `more_to_follow = false` both
    /// yield [`PullOutcome::Exhausted`].
    pub async fn pull_block(&mut self, wait: Duration) -> PullResult {
        self.require("pull_block", &[ClientState::Retrieving])?;
        let request = BlockRequest {
            timeout_secs: wait.as_secs(),
        };
        let read_timeout = wait + self.config.pull_grace;
        let reply = match self
            .exchange_json(MessageType::MessageBlockExt, &request, read_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(err) if err.is_end_of_window() => {
                tracing::debug!(host = %self.host, "Retrieval window drained");
                self.state = ClientState::Exhausted;
                return Ok(PullOutcome::Exhausted(RawMessageBlock::last(Vec::new())));
            }
            Err(err) => {
                self.state = ClientState::Failed;
                return Err(err);
            }
        };

        let block: BlockReply = match reply.decode_json() {
            Ok(block) => block,
            Err(err) => {
                self.state = ClientState::Failed;
                return Err(err.into());
            }
        };
        tracing::debug!(
            host = %self.host,
            messages = block.messages.len(),
            more_to_follow = block.more_to_follow,
            "Pulled block"
        );
        if block.more_to_follow {
            Ok(PullOutcome::Block(RawMessageBlock {
                messages: block.messages,
                more_to_follow: true,
            }))
        } else {
            self.state = ClientState::Exhausted;
            Ok(PullOutcome::Exhausted(RawMessageBlock::last(block.messages)))
        }
    }

    pub async fn status(&mut self) -> Result<ArchiveStatus, DdsError> {
        self.require(
            "status",
            &[ClientState::Authenticated, ClientState::Retrieving],
        )?;
        let current = self.state;
        let result = match self
            .transact(Frame::new(MessageType::Status, Vec::new()), self.config.io_timeout)
            .await
        {
            Ok(reply) => reply.decode_json::<ArchiveStatus>().map_err(DdsError::from),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.state = ClientState::Failed;
        } else {
            self.state = current;
        }
        result
    }

    /// Send a best-effort goodbye and shut the socket down.
    ///
    /// Idempotent; the client is `Disconnected` afterwards whatever the outcome.
    pub async fn close(&mut self) -> Result<(), DdsError> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        let previous = self.state;
        self.state = ClientState::Disconnected;

        let goodbye = if previous == ClientState::Failed {
            Ok(())
        } else {
            match Frame::new(MessageType::Goodbye, Vec::new()).encode() {
                Ok(bytes) => timeout(self.config.goodbye_timeout, self.stream.write_all(&bytes))
                    .await
                    .map_err(|_| DdsError::WriteTimeout)
                    .and_then(|r| r.map_err(DdsError::from)),
                Err(err) => Err(err.into()),
            }
        };
        let shutdown = self.stream.shutdown().await.map_err(DdsError::from);
        tracing::debug!(host = %self.host, port = self.port, from = %previous, "Closed archive connection");
        goodbye.and(shutdown)
    }

    fn require(&self, operation: &'static str, allowed: &[ClientState]) -> Result<(), DdsError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DdsError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn settle<T>(&mut self, result: Result<T, DdsError>, next: ClientState) -> Result<T, DdsError> {
        self.state = if result.is_ok() {
            next
        } else {
            ClientState::Failed
        };
        result
    }

    async fn exchange_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        body: &T,
        read_timeout: Duration,
    ) -> Result<Frame, DdsError> {
        let request = Frame::json(msg_type, body)?;
        self.transact(request, read_timeout).await
    }

    async fn transact(&mut self, request: Frame, read_timeout: Duration) -> Result<Frame, DdsError> {
        let expected = request.msg_type;
        let bytes = request.encode()?;
        timeout(self.config.io_timeout, self.stream.write_all(&bytes))
            .await
            .map_err(|_| DdsError::WriteTimeout)??;

        let response = timeout(read_timeout, self.read_frame())
            .await
            .map_err(|_| DdsError::ReadTimeout)??;
        if response.msg_type != expected {
            return Err(DdsError::UnexpectedResponse {
                expected: expected.name().to_string(),
                got: response.msg_type.name().to_string(),
            });
        }
        if let Some(reply) = response.as_server_error()? {
            tracing::debug!(
                host = %self.host,
                request = expected.name(),
                code = reply.code,
                errno = reply.errno,
                "Archive returned error"
            );
            return Err(reply.into());
        }
        Ok(response)
    }

    async fn read_frame(&mut self) -> Result<Frame, DdsError> {
        loop {
            if let Some(frame) = frame::decode_from_buffer(&mut self.read_buf)? {
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(DdsError::Disconnected);
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }
}
