//! Signal broadcaster
//!
//! Resolves a [`Target`] against the directory and delivers the signal to
//! every resolved access. Targets are handled concurrently and one failing
//! target never hides the results of the others.
//!
//! | Mode | Returns | Delivery |
//! |------|---------|----------|
//! | `fire` | resolved uids | background task, `forget` mode |
//! | `send` | [`SendResult`] | awaited, `send` mode |
//! | `post` | [`PostHandle`] | worker task, `send` mode |
//! | `send_to` | raw results | one explicit host, no directory lookup |
//!
//! Background work runs on the runtime current when the broadcaster was
//! built. Built outside of any runtime, it falls back to a small shared
//! runtime started on first use.

mod post;
mod target;

pub use post::{PostError, PostHandle};
pub use target::Target;

use futures::future::join_all;
use isonet_types::{BaseGroup, DeliveryMode, HostAccess, IsolateUid, SignalEnvelope};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BroadcasterConfig;
use crate::directory::Directory;
use crate::error::TransportError;
use crate::transport::{LocalReceiver, SignalTransport};

/// Aggregated outcome of a multi-target dispatch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendResult {
    /// Results of the targets that answered
    pub results: HashMap<IsolateUid, Vec<Value>>,
    /// Targets no provider could deliver to
    pub failed: HashSet<IsolateUid>,
}

impl SendResult {
    pub fn succeeded(&self) -> HashSet<&IsolateUid> {
        self.results.keys().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn target_count(&self) -> usize {
        self.results.len() + self.failed.len()
    }
}

/// The delivery engine
///
/// Cheap to clone: clones share the directory, transports and limits.
#[derive(Clone)]
pub struct Broadcaster {
    directory: Arc<Directory>,
    local: Arc<dyn LocalReceiver>,
    transports: Arc<RwLock<Vec<Arc<dyn SignalTransport>>>>,
    deadline: Option<Duration>,
    post_permits: Arc<Semaphore>,
    runtime: Option<Handle>,
}

static BACKGROUND: OnceLock<Option<Runtime>> = OnceLock::new();

/// Current runtime, else the shared background one
fn runtime_handle() -> Option<Handle> {
    if let Ok(handle) = Handle::try_current() {
        return Some(handle);
    }
    BACKGROUND
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("isonet-broadcast")
                .enable_all()
                .build()
                .map_err(|err| warn!(%err, "cannot start background runtime"))
                .ok()
        })
        .as_ref()
        .map(|runtime| runtime.handle().clone())
}

impl Broadcaster {
    pub fn new(
        directory: Arc<Directory>,
        local: Arc<dyn LocalReceiver>,
        transports: Vec<Arc<dyn SignalTransport>>,
        config: &BroadcasterConfig,
    ) -> Self {
        Self {
            directory,
            local,
            transports: Arc::new(RwLock::new(transports)),
            deadline: config.deadline(),
            post_permits: Arc::new(Semaphore::new(config.post_concurrency.max(1))),
            runtime: runtime_handle(),
        }
    }

    fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => Some(runtime.spawn(task)),
            None => {
                warn!("no runtime available, dispatch dropped");
                None
            }
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Append a provider, tried after the existing ones
    pub fn add_transport(&self, transport: Arc<dyn SignalTransport>) {
        self.transports.write().push(transport);
    }

    pub fn transport_names(&self) -> Vec<String> {
        self.transports
            .read()
            .iter()
            .map(|transport| transport.name().to_string())
            .collect()
    }

    /// Wrap content in an envelope sent by the local isolate
    pub fn make_envelope(&self, subject: &str, content: Value) -> SignalEnvelope {
        let local = self.directory.local_identity();
        SignalEnvelope::new(
            subject,
            local.uid.clone(),
            local.name.clone(),
            local.node.clone(),
            content,
        )
    }

    /// Deliver in the background, without waiting for any answer
    ///
    /// Returns the uids the target resolved to, `None` if none or if the
    /// dispatch could not be scheduled.
    pub fn fire(&self, subject: &str, content: Value, target: &Target) -> Option<Vec<IsolateUid>> {
        let accesses = self.resolve(subject, target)?;
        let mut uids: Vec<IsolateUid> = accesses.keys().cloned().collect();
        uids.sort();

        let envelope = self.make_envelope(subject, content);
        let this = self.clone();
        let subject = subject.to_string();
        self.spawn(async move {
            let result = this
                .dispatch(accesses, DeliveryMode::Forget, &subject, &envelope)
                .await;
            if !result.failed.is_empty() {
                debug!(subject = %subject, failed = ?result.failed, "fired signal not delivered everywhere");
            }
        })?;
        Some(uids)
    }

    pub fn fire_group(
        &self,
        subject: &str,
        content: Value,
        groups: &[BaseGroup],
    ) -> Option<Vec<IsolateUid>> {
        self.fire(subject, content, &Target::groups(groups))
    }

    /// Deliver and wait for every target
    ///
    /// Returns `None` when the target resolved to nothing.
    pub async fn send(&self, subject: &str, content: Value, target: &Target) -> Option<SendResult> {
        let accesses = self.resolve(subject, target)?;
        let envelope = self.make_envelope(subject, content);
        Some(
            self.dispatch(accesses, DeliveryMode::Send, subject, &envelope)
                .await,
        )
    }

    pub async fn send_group(
        &self,
        subject: &str,
        content: Value,
        groups: &[BaseGroup],
    ) -> Option<SendResult> {
        self.send(subject, content, &Target::groups(groups)).await
    }

    /// Deliver on a worker task
    ///
    /// Resolution happens now; `None` when the target resolved to nothing.
    pub fn post(
        &self,
        subject: &str,
        content: Value,
        target: &Target,
    ) -> Option<PostHandle<SendResult>> {
        let accesses = self.resolve(subject, target)?;
        let envelope = self.make_envelope(subject, content);
        let this = self.clone();
        let subject = subject.to_string();

        let worker = self.spawn(async move {
            let _permit = this.post_permits.clone().acquire_owned().await.ok();
            this.dispatch(accesses, DeliveryMode::Send, &subject, &envelope)
                .await
        })?;
        Some(PostHandle::new(worker))
    }

    pub fn post_group(
        &self,
        subject: &str,
        content: Value,
        groups: &[BaseGroup],
    ) -> Option<PostHandle<SendResult>> {
        self.post(subject, content, &Target::groups(groups))
    }

    /// Deliver to an explicit address, bypassing the directory
    pub async fn send_to(
        &self,
        subject: &str,
        content: Value,
        host: &str,
        port: u16,
    ) -> Result<Vec<Value>, TransportError> {
        let access = HostAccess::new(host, port);
        let envelope = self.make_envelope(subject, content);
        self.deliver(&access, DeliveryMode::Send, subject, &envelope)
            .await
    }

    /// Like `send_to`, in the background and ignoring the outcome
    pub fn fire_to(&self, subject: &str, content: Value, host: &str, port: u16) {
        let access = HostAccess::new(host, port);
        let envelope = self.make_envelope(subject, content);
        let this = self.clone();
        let subject = subject.to_string();
        self.spawn(async move {
            if let Err(err) = this
                .deliver(&access, DeliveryMode::Forget, &subject, &envelope)
                .await
            {
                debug!(%access, subject = %subject, %err, "fired signal not delivered");
            }
        });
    }

    pub fn post_to(
        &self,
        subject: &str,
        content: Value,
        host: &str,
        port: u16,
    ) -> PostHandle<Result<Vec<Value>, TransportError>> {
        let access = HostAccess::new(host, port);
        let envelope = self.make_envelope(subject, content);
        let this = self.clone();
        let subject = subject.to_string();

        self.spawn(async move {
            let _permit = this.post_permits.clone().acquire_owned().await.ok();
            this.deliver(&access, DeliveryMode::Send, &subject, &envelope)
                .await
        })
        .map_or_else(PostHandle::not_scheduled, PostHandle::new)
    }

    fn resolve(&self, subject: &str, target: &Target) -> Option<HashMap<IsolateUid, HostAccess>> {
        let accesses = target.resolve(&self.directory);
        if accesses.is_empty() {
            debug!(subject, ?target, "no target for signal");
            return None;
        }
        Some(accesses)
    }

    async fn dispatch(
        &self,
        accesses: HashMap<IsolateUid, HostAccess>,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> SendResult {
        let deliveries = accesses.into_iter().map(|(uid, access)| async move {
            let outcome = self.deliver(&access, mode, subject, envelope).await;
            (uid, access, outcome)
        });

        let mut result = SendResult::default();
        for (uid, access, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(values) => {
                    result.results.insert(uid, values);
                }
                Err(err) => {
                    warn!(%uid, %access, subject, %err, "signal delivery failed");
                    result.failed.insert(uid);
                }
            }
        }
        result
    }

    /// Deliver to one access, within the deadline if any
    async fn deliver(
        &self,
        access: &HostAccess,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Vec<Value>, TransportError> {
        let attempt = self.attempt(access, mode, subject, envelope);
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, attempt)
                .await
                .map_err(|_| TransportError::Timeout(access.to_string()))?,
            None => attempt.await,
        }
    }

    async fn attempt(
        &self,
        access: &HostAccess,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Vec<Value>, TransportError> {
        if access.is_local() {
            return self
                .local
                .deliver_local(subject, envelope, mode)
                .await
                .ok_or_else(|| TransportError::Undeliverable(format!("{subject} refused locally")));
        }

        let transports: Vec<Arc<dyn SignalTransport>> = self.transports.read().clone();
        for transport in &transports {
            match transport.deliver(access, mode, subject, envelope).await {
                Ok(values) => return Ok(values),
                Err(err) => {
                    debug!(transport = transport.name(), %access, subject, %err, "provider failed, trying next");
                }
            }
        }
        Err(TransportError::Exhausted(access.to_string()))
    }
}
