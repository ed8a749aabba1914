//! Tollgate - fail-closed admission control
//!
//! Counts requests per policy and identifier in fixed windows, sharing the
//! counters across processes through Redis and falling back to an in-process
//! store when allowed. When no store can answer in remote-only mode, requests
//! are denied rather than admitted unchecked.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
