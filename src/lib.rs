//! Courier - message bus reliability core
//!
//! The subsystem a point-to-point bus relies on to not lose messages:
//! a transport pump driving a resizable worker pool with lifecycle
//! events, a fault router that quarantines poison messages to an error
//! queue (and crashes loudly when even that fails), and a gateway
//! deduplication store giving at-most-once acceptance of inbound
//! messages under optimistic concurrency.

pub mod config;
pub mod faults;
pub mod gateway;
pub mod logging;
pub mod message;
pub mod transport;

#[cfg(test)]
pub mod test_utils;
