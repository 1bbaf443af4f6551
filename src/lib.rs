//! `rsbb` - referee box for timed robot competition trials
//!
//! Tracks which robots are present, runs benchmark trials against them over
//! private channels, synchronizes with external benchmarking boxes over a
//! publish/subscribe bus, and exposes live status and controls to the
//! operator console.

pub mod bus;
pub mod cli;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod messages;
pub mod observability;
pub mod presence;
pub mod shared;
pub mod timing;
pub mod transport;
pub mod trial;
