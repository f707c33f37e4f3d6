//! Courier Agent Library
//!
//! A local forwarding agent: tenant payloads arrive over HTTP, are sealed
//! with a per-tenant daily key and delivered upstream. Payloads that cannot
//! be delivered right now are kept in a durable queue and drained in the
//! background.

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod delivery;
pub mod gateway;
pub mod metrics;
pub mod metrics_server;
pub mod queue;
pub mod sync;
