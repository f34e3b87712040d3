#![forbid(unsafe_code)]

//! Message bus and privilege broker for privilege-separated multi-process
//! applications.
//!
//! One privileged coordinator talks to sandboxed workers over framed local
//! channels. Every message carries a typed envelope, is routed by priority
//! class, and every access a worker makes to system resources goes through
//! the capability-checked [`broker::Broker`].

pub mod audit;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod models;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::BusConfig;
pub use coordinator::Coordinator;
pub use errors::{AppError, Result};
pub use worker::Worker;
