//! # Termhub
//!
//! This crate spawns and supervises interactive pseudo-terminal sessions on
//! behalf of many concurrent callers.
//!
//! ## Overview
//!
//! - **Admission control**: a hard session limit checked before any process
//!   is spawned
//! - **Output pipeline**: bounded per-session scrollback plus throttled,
//!   size-bounded delivery batches
//! - **Resize coordination**: repaint noise after a resize is suppressed for
//!   a short settle window
//! - **Termination**: a graceful hang-up followed by a forced kill, always
//!   converging to removal
//! - **Reconnection**: authoritative scrollback snapshots without duplicate
//!   batch replay
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SessionRegistry                         │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ShellResolver │  │WorkingDirResolver│  │   EnvPolicy    │  │
//! │  └──────────────┘  └──────────────────┘  └────────────────┘  │
//! │                                                              │
//! │  Session ──► OutputPipeline ──► SubscriptionHub ──► callers  │
//! │     │              ▲                                         │
//! │     │        ResizeCoordinator                               │
//! │     ▼                                                        │
//! │  TerminationSupervisor (signal / console terminator)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termhub::{Config, CreateOptions, SessionManager, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = SessionRegistry::new(&config);
//!
//!     let _output = registry.on_data(|id, data| {
//!         println!("{id}: {}", String::from_utf8_lossy(data));
//!     });
//!
//!     let session = registry.create(CreateOptions::default()).await?;
//!     registry.write(&session.id, b"echo hello\n");
//!
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY session creation and supervision

pub mod config;
pub mod session;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    CreateOptions, ExitStatus, HealthReport, Session, SessionError, SessionId, SessionInfo,
    SessionManager, SessionRegistry, SessionState, Subscription,
};
