//! Turnstile - HTTP Admission Control
//!
//! This crate implements sliding-window request admission for HTTP services.
//! Requests are keyed by caller address, identity, or path, matched against an
//! ordered rule list, and counted in either a sharded in-process store or a
//! shared Redis instance. Rejected requests get a configurable status and a
//! JSON body.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
