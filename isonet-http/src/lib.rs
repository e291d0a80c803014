//! HTTP carriage for isonet signals
//!
//! Signals are POSTed as JSON envelopes to `{path}{subject}` on the target's
//! receiver, the delivery mode travelling in the `isonet-mode` header. The
//! answer is a JSON [`ReceiverReply`](isonet_core::ReceiverReply) whose code
//! is also the HTTP status.

pub mod server;
pub mod transport;

pub use server::{router, serve, ReceiverState};
pub use transport::HttpTransport;

/// Header carrying the delivery mode
pub const MODE_HEADER: &str = "isonet-mode";
