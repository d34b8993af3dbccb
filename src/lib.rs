//! Mail dispatcher — subject-routed mailbox forwarding.

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod transport;
pub mod worker;
