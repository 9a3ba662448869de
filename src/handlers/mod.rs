//! Request handlers for the `omni-bus` server.

pub mod http;

pub use http::{router, serve, ChannelMessage, Direction};

#[cfg(test)]
mod tests;
