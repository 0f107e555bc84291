//! hrchat core library: history API client, streamed answer decoding, conversation
//! state, and speech coordination used by the CLI.

pub mod auth;
pub mod config;
pub mod conversation;
pub mod error;
pub mod history;
pub mod init;
pub mod speech;
pub mod stream;
