//! ddsbridge-core: session-scoped archive retrieval and worker event
//! streams.
//!
//! This crate provides the core of `ddsb`: stateful protocol clients for a
//! DDS-style message archive and for worker event ports, a per-session
//! connection cache that keeps at most one live client per key, and the
//! orchestrators that drive them.
//!
//! # Architecture
//!
//! ```text
//! caller (session key) → Gateway ─┬→ RetrievalOrchestrator → RetrievalClient → archive
//!                                 └→ EventOrchestrator     → EventStreamClient → worker
//!                                          ↕
//!                                   ConnectionCache (slot per key)
//! ```
//!
//! # Modules
//!
//! - `gateway`: Facade, session teardown and the idle reaper
//! - `retrieval`: Criteria store and paged block retrieval
//! - `appmon`: Worker event polling with restart detection
//! - `cache`: Per-key client slots
//! - `dds`: Frame codec and the retrieval protocol client
//! - `events`: Worker event-port client and line parsing
//! - `sources`: Endpoint, netlist and worker-registry collaborators
//! - `model`: Criteria, messages, statuses and events
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod appmon;
pub mod cache;
pub mod concurrent_map;
pub mod config;
pub mod dds;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod retrieval;
pub mod sources;

pub use config::Config;
pub use error::{Error, GatewayError, GatewayErrorKind, Result};
pub use gateway::{Gateway, ReapReport, ReaperHandle};
pub use model::{AppEvent, AppId, RawMessage, RawMessageBlock, SearchCriteria, SessionKey};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
