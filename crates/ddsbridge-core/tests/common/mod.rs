//! Shared test infrastructure for ddsbridge-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{MockArchive, MockWorker};
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ddsbridge_core::Gateway;
use ddsbridge_core::config::{Config, PortSetting, SourceConfig};
use ddsbridge_core::dds::frame::{self, Frame, MessageType, ServerReply};
use ddsbridge_core::model::{ArchiveStatus, RawMessage};
use ddsbridge_core::sources::WorkerRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ---------------------------------------------------------------------------
// MockArchive: scripted DDS peer
// ---------------------------------------------------------------------------

/// Reply to one MessageBlockExt request.
#[derive(Debug, Clone)]
pub enum BlockStep {
    /// `count` messages named `{prefix}{n}`.
    Block {
        prefix: &'static str,
        count: usize,
        more: bool,
    },
    EndOfWindow,
    ServerError(i32),
    /// Drop the connection without replying.
    Hangup,
}

/// Behaviour of every connection to a [`MockArchive`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveScript {
    pub blocks: Vec<BlockStep>,
    /// Reject criteria with this server code.
    pub reject_criteria: Option<i32>,
}

/// A loopback archive replaying the same script on each connection.
pub struct MockArchive {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Frame>>>,
}

fn block_frame(prefix: &str, count: usize, more: bool) -> Frame {
    let messages: Vec<RawMessage> = (0..count)
        .map(|n| RawMessage {
            platform_id: Some(format!("{prefix}{n}")),
            ..RawMessage::default()
        })
        .collect();
    Frame::json(
        MessageType::MessageBlockExt,
        &serde_json::json!({ "messages": messages, "more_to_follow": more }),
    )
    .unwrap()
}

fn server_error(msg_type: MessageType, code: i32) -> Frame {
    Frame::server_error(
        msg_type,
        &ServerReply {
            code,
            errno: 0,
            message: format!("mock error {code}"),
        },
    )
}

impl MockArchive {
    pub async fn start(script: ArchiveScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let conn_count = Arc::clone(&connections);
        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut steps = script.blocks.clone().into_iter();
                    let mut buf = Vec::new();
                    loop {
                        let mut chunk = [0u8; 4096];
                        let n = match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        while let Ok(Some(request)) = frame::decode_from_buffer(&mut buf) {
                            log.lock().unwrap().push(request.clone());
                            let reply = match request.msg_type {
                                MessageType::Goodbye => return,
                                MessageType::Criteria => match script.reject_criteria {
                                    Some(code) => server_error(MessageType::Criteria, code),
                                    None => Frame::new(MessageType::Criteria, Vec::new()),
                                },
                                MessageType::Status => Frame::json(
                                    MessageType::Status,
                                    &ArchiveStatus {
                                        hostname: Some("mock-lrgs".into()),
                                        is_usable: Some(true),
                                        ..ArchiveStatus::default()
                                    },
                                )
                                .unwrap(),
                                MessageType::MessageBlockExt => match steps.next() {
                                    Some(BlockStep::Block {
                                        prefix,
                                        count,
                                        more,
                                    }) => block_frame(prefix, count, more),
                                    Some(BlockStep::EndOfWindow) | None => server_error(
                                        MessageType::MessageBlockExt,
                                        frame::END_OF_WINDOW,
                                    ),
                                    Some(BlockStep::ServerError(code)) => {
                                        server_error(MessageType::MessageBlockExt, code)
                                    }
                                    Some(BlockStep::Hangup) => return,
                                },
                                other => Frame::new(other, Vec::new()),
                            };
                            if stream.write_all(&reply.encode().unwrap()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            port,
            connections,
            requests,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request types received so far, across all connections.
    pub fn request_types(&self) -> Vec<MessageType> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.msg_type)
            .collect()
    }

    pub fn requests_of(&self, msg_type: MessageType) -> Vec<Frame> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.msg_type == msg_type)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockWorker: event-port peer
// ---------------------------------------------------------------------------

/// A loopback worker event port.
///
/// Each accepted connection is sent `lines`, then held open or closed.
pub struct MockWorker {
    pub port: u16,
    connections: Arc<AtomicUsize>,
}

impl MockWorker {
    pub async fn start(lines: Vec<String>, close_after_send: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let lines = lines.clone();
                tokio::spawn(async move {
                    for line in &lines {
                        if stream.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    if close_after_send {
                        let _ = stream.shutdown().await;
                        return;
                    }
                    // Hold the connection until the client goes away.
                    let mut sink = [0u8; 64];
                    while let Ok(n) = stream.read(&mut sink).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        Self { port, connections }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Gateway wiring
// ---------------------------------------------------------------------------

/// Config pointing the default source at `127.0.0.1:port` with short timeouts.
pub fn config_for(port: u16) -> Config {
    let mut config = Config::default();
    config.gateway.pull_timeout_secs = 1;
    config.gateway.connect_timeout_ms = 2_000;
    config.gateway.io_timeout_ms = 2_000;
    config.gateway.event_poll_window_ms = 100;
    config.sources.push(SourceConfig {
        name: "mock".into(),
        host: Some("127.0.0.1".into()),
        port: Some(PortSetting::Number(i64::from(port))),
        ..SourceConfig::default()
    });
    config
}

pub fn gateway_for(port: u16, workers: Arc<dyn WorkerRegistry>) -> Gateway {
    Gateway::from_config(&config_for(port), workers)
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
