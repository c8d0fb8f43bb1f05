//! Fan-out-on-write timeline pipeline.
//!
//! New posts are written into every follower's feed by background jobs, a
//! bounded window of each subscriber's most recent entries is kept in the
//! cache, and readers page through the feed with opaque cursors that blend
//! cached and durable results.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
