//! # Agent Runtime Module
//!
//! Process-level plumbing shared by the directory agent and the service agent.
//!
//! ## Key Types
//!
//! - [`SlpConfig`] - JSON configuration with per-field defaults
//! - [`KeyedExecutor`] - one serial worker per key (per directory agent)
//! - [`Lifecycle`] / [`ServerState`] - guarded start/stop state machine
//! - [`AgentServer`] / [`MessageHandler`] - UDP, TCP and timer threads around a handler
//!
//! ## Lifecycle
//!
//! 1. Load configuration: `SlpConfig::load("slp.json")`
//! 2. Build a handler: `DirectoryAgent::new(&config)`
//! 3. Start: `server.start()` binds sockets and spawns listeners
//! 4. Stop: `server.stop()` runs exit actions and joins listeners
//!
//! ## Example
//!
//! ```ignore
//! let config = SlpConfig::load("slp.json")?;
//! let agent = Arc::new(DirectoryAgent::new(&config)?);
//! let server = AgentServer::new(agent, ServerOptions::from_config(&config)?);
//! server.start()?;
//! server.wait_stopped();
//! ```

pub mod config;
pub mod executor;
pub mod lifecycle;
pub mod server;

pub use config::SlpConfig;
pub use executor::KeyedExecutor;
pub use lifecycle::{Lifecycle, ServerState};
pub use server::{fit_datagram, AgentServer, MessageHandler, ServerContext, ServerOptions};
