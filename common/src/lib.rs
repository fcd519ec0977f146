//! Shared types for the NVR agent: configuration, the device wire
//! protocol, credential digests and the error taxonomy.

pub mod config;
pub mod digest;
pub mod error;
pub mod protocol;
pub mod recording;
