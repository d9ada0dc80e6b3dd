//! Error types for the peer mesh

use crate::types::{PeerHandle, PeerId};
use thiserror::Error;

/// Errors decoding or encoding wire frames
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Pose payload has {0} fields (expected 3 or 7)")]
    PoseFieldCount(usize),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Errors reported by a link layer implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("No connection for handle {0}")]
    UnknownHandle(PeerHandle),

    #[error("Endpoint {0} is unreachable")]
    Unreachable(PeerHandle),

    #[error("Link layer closed")]
    Closed,
}

/// Invalid configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),

    #[error("{0} must be a finite probability")]
    NotFinite(&'static str),
}

/// Errors surfaced through the application handle
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Peer {0} has no confirmed connection")]
    UnknownPeer(PeerId),

    #[error("Mesh node has stopped")]
    Stopped,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;
