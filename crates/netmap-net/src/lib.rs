//! Networking for network map synchronization
//!
//! This crate provides:
//! - The remote directory capability ([`NetworkMapClient`])
//! - Length-prefixed message framing
//! - A TCP request/response directory client

pub mod client;
pub mod framing;

pub use client::{ClientError, NetworkMapClient, NetworkMapResponse, TcpNetworkMapClient};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
