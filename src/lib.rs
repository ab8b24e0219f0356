//! Mail Relay: stream inbound email to a webhook as raw text and JSON.

pub mod config;
pub mod decoder;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod server;
pub mod stream;
pub mod structurer;
