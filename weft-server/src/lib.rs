//! Weft Orchestration Server
//!
//! This crate runs flows built with `weft-core` across a pool of
//! connected workers.
//!
//! # Overview
//!
//! All state lives in a single processing task: worker connections,
//! enrolled flows, the execute list, and armed deadlines. Transports,
//! timers, and handles feed it events through one queue, so no handler
//! ever races another. Scheduling is a refresh pass that matches
//! execute-eligible classes, smallest first, against the idle pool.
//!
//! # Key Components
//!
//! - **ServerProcessor / ServerHandle**: the loop and the cloneable
//!   handle that creates flows, queries state, and shuts down
//! - **FlowProxy**: a caller's stake in one flow, with its outcome
//! - **ServerLogic**: the state machine behind the loop
//! - **InMemoryTransport**: a loopback transport for embedding and
//!   testing workers without a network
//!
//! # Example
//!
//! ```ignore
//! use weft_server::{ServerConfig, ServerProcessor};
//!
//! let handle = ServerProcessor::spawn(ServerConfig::from_env());
//! let mut proxy = handle
//!     .create_flow("sort", builder, parameters, FlowFlags::ALL, attachment)
//!     .await?;
//! proxy.await_done().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod events;
pub mod logic;
pub mod processor;
pub mod timer;
pub mod transport;

pub use client::{ClientState, ClientStatus};
pub use config::ServerConfig;
pub use events::{
    ClassSnapshot, FlowEvent, FlowEventKind, FlowFlags, FlowSnapshot, ServerEvent,
};
pub use processor::{FlowProxy, ServerHandle, ServerProcessor};
pub use transport::{Connection, InMemoryTransport};
