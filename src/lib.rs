//! Request shield
//!
//! Security event pipeline and adaptive rate limiting for request-processing
//! middleware. Collaborators report security events, the pipeline keeps a
//! bounded history, derives metrics, fires threat rules and produces reports.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
