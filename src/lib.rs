//! A queue-protocol broker bridging message clients onto a log-structured pub/sub store.

pub mod app;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod filter;
pub mod longpoll;
pub mod processor;
pub mod pubsub;
pub mod remoting;
pub mod schedule;
pub mod server;
pub mod timer;
#[cfg(test)]
mod timer_test;
pub mod utils;

// Public exports for binaries.
pub use crate::{app::App, config::Config};
