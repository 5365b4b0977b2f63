//! routerbench -- throughput and loss validation of a router under test.
//!
//! A traffic generator with two ports is cabled to the router: one port
//! sends a continuous UDP stream towards a destination routed out of the
//! other. A run connects to the generator, makes both ports known to the
//! router, streams for a fixed duration, and compares the sender's
//! transmit counter with the receiver's receive counter.

pub mod arp;
pub mod config;
pub mod device;
pub mod evaluate;
pub mod orchestrator;
pub mod packet;
pub mod report;
pub mod topology;
pub mod traffic;

pub use orchestrator::{Orchestrator, RunConfig, RunError, RunReport};
