//! Error types for isonet-core

use isonet_types::{IsolateUid, NodeUid};
use thiserror::Error;

use crate::config::ConfigError;

/// Top-level error
#[derive(Debug, Error)]
pub enum CoreError {
    /// Directory errors
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Signal delivery errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Discovery errors
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Directory mutation errors
///
/// Lookups never fail: an unknown isolate is an absent result.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Malformed registration parameters
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The uid is already registered on another node
    ///
    /// An invalid argument as well: a uid never moves between nodes.
    #[error("Isolate {uid} already registered on node {existing}, refused on node {requested}")]
    Conflict {
        uid: IsolateUid,
        existing: NodeUid,
        requested: NodeUid,
    },
}

impl DirectoryError {
    /// Every directory error is an invalid argument of the caller
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::Conflict { .. })
    }
}

/// Errors raised by a transport provider for one target
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target could not be reached
    #[error("Target {0} unreachable: {1}")]
    Unreachable(String, String),

    /// The payload could not be serialized or sent by this provider
    #[error("Undeliverable signal: {0}")]
    Undeliverable(String),

    /// The target answered with an error code
    #[error("Signal rejected with code {code}: {message}")]
    Rejected { code: u16, message: String },

    /// The target answered with something that is not a receiver reply
    #[error("Malformed reply: {0}")]
    Malformed(String),

    /// No provider is configured or every provider failed
    #[error("No transport could deliver to {0}")]
    Exhausted(String),

    /// The per-target deadline elapsed
    #[error("Deadline elapsed waiting for {0}")]
    Timeout(String),
}

/// Discovery protocol errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket setup or I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured multicast group is not a multicast address
    #[error("Invalid multicast group: {0}")]
    InvalidGroup(String),

    /// The receiver has no access port to announce
    #[error("Isolate is not reachable: no receiver port bound")]
    NotReachable,

    /// Packet decoding failure
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result type using DirectoryError
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;
