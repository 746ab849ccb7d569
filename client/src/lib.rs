//! # Stage Sync Client Library
//!
//! Client-side synchronization core for a per-stage game leaderboard. It
//! registers a participant, submits gameplay results over a persistent
//! stream, and keeps a live "best run per player" ranking from a second
//! persistent feed.
//!
//! ## Architecture Overview
//!
//! Four network channels run concurrently with one session owner:
//!
//! ### Request/Response
//! Registration and progress queries are one-shot HTTP calls with a bounded
//! timeout. Progress is only fetched when the user asks for it.
//!
//! ### Persistent Streams
//! The result stream carries submissions up and acknowledgements or ranking
//! results down. The chart feed carries snapshots and single records of every
//! participant's runs. A third stream sends free-text prompts and receives
//! the game action each one maps to. Each stream gets its own liveness
//! monitor.
//!
//! ### Designated Context
//! Network tasks never mutate session state. They enqueue callbacks onto a
//! dispatcher, and the session owner drains that queue in order. A bad frame
//! or a failing callback is logged and skipped.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - WebSocket channel with an observable connection state
//! - HTTP channel with per-request timeout and error classification
//!
//! ### Leaderboard Module (`leaderboard`)
//! - Snapshot and incremental aggregation into one best record per participant
//! - Sorted, stable ranked views per stage
//! - Bounded window of recent raw records
//!
//! ### Session Module (`session`)
//! - Configuration, registration state and run validation
//! - Routing of stream, chart and prompt events to the [`session::Presenter`]
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::identity::MemoryIdentityStore;
//! use client::session::{ClientSession, LogPresenter, RunSubmission, SessionConfig};
//!
//! # async fn demo() -> Result<(), client::error::ClientError> {
//! let config = SessionConfig::default().with_watched("A1");
//! let mut session = ClientSession::new(
//!     config,
//!     Box::new(MemoryIdentityStore::new()),
//!     Box::new(LogPresenter::default()),
//! )?;
//!
//! session.register("player_001", false).await?;
//! session.connect();
//!
//! while session.next_event().await {
//!     if session.stream_state().is_open() {
//!         session.submit_run(&RunSubmission::new("player_001", "A1", 42, 12_500))?;
//!         break;
//!     }
//! }
//! session.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod leaderboard;
pub mod liveness;
pub mod network;
pub mod session;

pub use error::{ClientError, ValidationError};
pub use leaderboard::{BoardChange, Leaderboard};
pub use session::{ClientSession, Presenter, RunSubmission, SessionConfig};
