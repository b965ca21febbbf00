//! # Stackfall Server
//!
//! Authoritative backend for a competitive falling-block puzzle game.
//!
//! The crate has two independent halves:
//!
//! - **Match coordinator**: pairs live connections into versus matches over
//!   JSON text messages, deals both players the same piece bags, converts
//!   line clears into garbage and announces the final results.
//! - **Run verifier**: an HTTP API for long progression runs where the
//!   stored score and level come only from server arithmetic over line
//!   deltas, and every mutating call must present an HMAC run token.
//!
//! ## Features
//!
//! - **Transport-agnostic matches**: implement [`Transport`] for any
//!   connection type and hand it to [`session::run_session`]
//! - **WebSocket built-in**: default `transport-websocket` feature provides
//!   `WebSocketTransport` and the `MatchServer` accept loop
//! - **HTTP run API**: default `http-api` feature provides an axum router
//!   over a pluggable [`RunStore`]
//!
//! ## Quick Start
//!
//! ```
//! use stackfall_server::{MatchCoordinator, MemoryRunStore, RunTokenSigner, RunVerifier};
//!
//! let coordinator = MatchCoordinator::new();
//! let verifier = RunVerifier::new(MemoryRunStore::new(), RunTokenSigner::new("secret"));
//! # let _ = (coordinator, verifier);
//! ```

pub mod bag;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod error_codes;
pub mod garbage;
pub mod matches;
pub mod protocol;
pub mod run;
pub mod scoring;
pub mod session;
pub mod store;
pub mod token;
pub mod transport;
pub mod verifier;

#[cfg(feature = "transport-websocket")]
pub mod server;
#[cfg(feature = "transport-websocket")]
pub mod transports;

#[cfg(feature = "http-api")]
pub mod http;

// Re-export primary types for ergonomic imports.
pub use config::ServerConfig;
pub use coordinator::{JoinRequest, MatchCoordinator, Seat};
pub use error::StackfallError;
pub use error_codes::ErrorCode;
pub use protocol::{ClientMessage, MatchMode, Piece, ServerMessage};
pub use run::{Run, RunStatus};
pub use store::{MemoryRunStore, RedbRunStore, RunStore, StoreError};
pub use token::RunTokenSigner;
pub use transport::Transport;
pub use verifier::{RunError, RunVerifier};

#[cfg(feature = "transport-websocket")]
pub use server::{MatchServer, SessionSettings};
#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
