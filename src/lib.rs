//! Redis-backed message bus.
//!
//! Long-lived workers register themselves under a site namespace and serve
//! commands; transient clients address them directly, by group, by multicast
//! pattern or by site-wide broadcast, and collect single-shot or streamed
//! replies over correlation-derived reply queues.

pub mod client;
pub mod command;
pub mod config;
pub mod envelope;
pub mod keys;
pub mod log_sink;
pub mod monitor;
pub mod queue;
pub mod subscription;
pub mod transfer;
pub mod worker;
pub mod workers;

pub use client::{perform_rpc, Client, ReplyPayload, RpcRequest};
pub use command::{CommandContext, CommandRegistry, CommandReply, WorkerBehavior};
pub use config::BusConfig;
pub use envelope::Envelope;
pub use worker::{Worker, WorkerConfig, WorkerHandle};
pub use workers::WorkerFactory;
