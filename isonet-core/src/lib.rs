//! isonet-core - isolate directory, signal broadcaster and multicast discovery
//!
//! The coordination layer of a set of worker processes ("isolates") spread
//! across hosts ("nodes"):
//!
//! ```text
//!            ┌────────────┐  beacons / CONFIRM  ┌───────────┐
//!   UDP ────▶│ Discovery  │────────────────────▶│           │
//!            └─────┬──────┘      register       │ Directory │
//!                  │ send_to                    │           │
//!            ┌─────▼──────┐       resolve       └─────▲─────┘
//!            │ Broadcaster│─────────────────────────────┘
//!            └─────┬──────┘
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//!   SignalTransport     LocalReceiver
//!   (remote access)     (local sentinel)
//! ```
//!
//! The [`Directory`] is the only mutable shared state. The
//! [`DirectoryUpdater`] runs the registration handshake that moves
//! discovered isolates to the validated state. [`Isonet`] wires everything
//! together.

pub mod broadcaster;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod receiver;
pub mod runtime;
pub mod transport;
pub mod updater;

pub use broadcaster::{Broadcaster, PostError, PostHandle, SendResult, Target};
pub use config::{ConfigError, IsonetConfig, LocalIdentity};
pub use directory::{
    CallbackListener, Directory, DirectorySnapshot, IsolateRecord, PresenceEvent, PresenceListener,
};
pub use discovery::Discovery;
pub use error::{CoreError, DirectoryError, DiscoveryError, Result, TransportError};
pub use receiver::{ReceiverReply, SignalListener, SignalReceiver};
pub use runtime::Isonet;
pub use transport::{LocalReceiver, LoopbackNetwork, LoopbackTransport, SignalTransport};
pub use updater::DirectoryUpdater;

pub use isonet_types as types;
