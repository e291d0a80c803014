//! Shared types for isonet
//!
//! This crate provides the vocabulary used across the isonet crates:
//! isolate and node identifiers, host accesses, the base groups computed
//! by the directory, presence states and the signal envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Isolate identifier
///
/// Globally unique and immutable, assigned by the isolate itself or by
/// its launcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsolateUid(pub String);

impl IsolateUid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsolateUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IsolateUid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for IsolateUid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for IsolateUid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Node identifier
///
/// A node is a host running one or more isolates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUid(pub String);

impl NodeUid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeUid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeUid {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for NodeUid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How to reach one isolate
///
/// An access without address and with port 0 is the local sentinel: the
/// target lives in this process and no network hop is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAccess {
    pub address: Option<String>,
    pub port: u16,
}

impl HostAccess {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: Some(address.into()),
            port,
        }
    }

    /// The "same process" sentinel
    pub fn local() -> Self {
        Self {
            address: None,
            port: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.address.is_none() && self.port == 0
    }

    /// Format as `host:port`, bracketing IPv6 literals
    pub fn socket_addr(&self) -> Option<String> {
        let host = self.address.as_deref()?;
        if host.contains(':') && !host.starts_with('[') {
            Some(format!("[{}]:{}", host, self.port))
        } else {
            Some(format!("{}:{}", host, self.port))
        }
    }
}

impl fmt::Display for HostAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => f.write_str(&addr),
            None => f.write_str("<local>"),
        }
    }
}

/// Error returned when parsing one of the enumerations of this crate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Symbolic groups computed by the directory at read time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BaseGroup {
    /// Every validated isolate, including the current one
    All,
    /// The current isolate only
    Current,
    /// Validated isolates tagged `forkers`
    Forkers,
    /// Validated isolates tagged `monitors`
    Monitors,
    /// Every validated isolate that is not a forker (monitors included)
    Isolates,
    /// Validated isolates on the current node, except the current one
    Neighbours,
    /// Every validated isolate except the current one
    Others,
    /// Every registered isolate, whatever its presence state
    Stored,
}

impl BaseGroup {
    pub const VARIANTS: [BaseGroup; 8] = [
        BaseGroup::All,
        BaseGroup::Current,
        BaseGroup::Forkers,
        BaseGroup::Monitors,
        BaseGroup::Isolates,
        BaseGroup::Neighbours,
        BaseGroup::Others,
        BaseGroup::Stored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BaseGroup::All => "ALL",
            BaseGroup::Current => "CURRENT",
            BaseGroup::Forkers => "FORKERS",
            BaseGroup::Monitors => "MONITORS",
            BaseGroup::Isolates => "ISOLATES",
            BaseGroup::Neighbours => "NEIGHBOURS",
            BaseGroup::Others => "OTHERS",
            BaseGroup::Stored => "STORED",
        }
    }

    /// Tag an isolate declares to belong to this group, for tag-based groups
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            BaseGroup::Forkers => Some(FORKERS_TAG),
            BaseGroup::Monitors => Some(MONITORS_TAG),
            _ => None,
        }
    }
}

/// Group tag of forker isolates
pub const FORKERS_TAG: &str = "forkers";

/// Group tag of monitor isolates
pub const MONITORS_TAG: &str = "monitors";

impl fmt::Display for BaseGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseGroup {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BaseGroup::VARIANTS
            .into_iter()
            .find(|group| group.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant {
                kind: "group",
                value: s.to_string(),
            })
    }
}

/// Presence state of a registered isolate
///
/// An unknown isolate has no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Registered,
    Synchronizing,
    Validated,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Registered => f.write_str("registered"),
            PresenceState::Synchronizing => f.write_str("synchronizing"),
            PresenceState::Validated => f.write_str("validated"),
        }
    }
}

/// How the receiving side must handle a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Run the listeners and return their results
    #[default]
    Send,
    /// Return at once, run the listeners in the background
    Forget,
    /// Return at once if a listener matches, then run them in the background
    Ack,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Send => "send",
            DeliveryMode::Forget => "forget",
            DeliveryMode::Ack => "ack",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "send" => Ok(DeliveryMode::Send),
            "forget" => Ok(DeliveryMode::Forget),
            "ack" => Ok(DeliveryMode::Ack),
            _ => Err(UnknownVariant {
                kind: "delivery mode",
                value: s.to_string(),
            }),
        }
    }
}

/// The unit of communication between isolates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Slash-delimited signal name
    pub subject: String,
    pub sender_uid: IsolateUid,
    pub sender_name: String,
    pub sender_node: NodeUid,
    /// Filled by the receiving side from the peer address
    #[serde(default)]
    pub sender_address: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl SignalEnvelope {
    /// Create an envelope stamped with the current time
    pub fn new(
        subject: impl Into<String>,
        sender_uid: IsolateUid,
        sender_name: impl Into<String>,
        sender_node: NodeUid,
        content: serde_json::Value,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender_uid,
            sender_name: sender_name.into(),
            sender_node,
            sender_address: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            content,
        }
    }

    /// Decode the content into a typed value
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.content)
    }
}

/// Subscription identifier
///
/// Returned when subscribing a listener, used to later unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    /// Create a new unique subscription ID
    pub fn new() -> Self {
        Self(SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}
