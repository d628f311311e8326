// src/lib.rs

//! Domain security scan orchestration: DMARC/SPF/DKIM, TLS, and HTTPS
//! probes, deterministic guidance classification, and the queueing and
//! coordination plumbing that runs them as a fleet.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod dispatcher;
pub mod envelope;
pub mod gateway;
pub mod kv;
pub mod logging;
pub mod processor;
pub mod store;
