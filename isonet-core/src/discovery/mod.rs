//! Multicast discovery
//!
//! At startup the isolate sends a REGISTER beacon carrying its signal port
//! to the multicast group, then keeps listening to the group. Every beacon
//! received from a peer starts a CONFIRM exchange on a worker task; the
//! exchange registers both isolates in each other's directory.
//!
//! ```text
//!   P                                     Q
//!   │── REGISTER(port) ── multicast ────▶ │
//!   │ ◀── CONFIRM {Q identity} ── signal ─│  P registers Q
//!   │──── {P identity} ── reply ────────▶ │  Q registers P
//! ```

mod confirm;
mod packet;
mod socket;

pub use confirm::{ConfirmBeat, SIGNAL_CONFIRM_BEAT};
pub use packet::{Packet, PACKET_REGISTER};

use isonet_types::SubscriptionId;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::DiscoveryConfig;
use crate::directory::Directory;
use crate::error::DiscoveryError;
use crate::receiver::{SignalReceiver, DEFAULT_PRIORITY};
use crate::updater::DirectoryUpdater;
use confirm::{ConfirmListener, PeerRegistrar};
use socket::MulticastSocket;

/// Largest datagram read from the group
const MAX_DATAGRAM: usize = 1500;

struct Running {
    socket: Arc<MulticastSocket>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Shared by the listener loop and the exchange workers
struct Shared {
    broadcaster: Broadcaster,
    registrar: Arc<PeerRegistrar>,
    permits: Arc<Semaphore>,
}

/// The discovery agent
pub struct Discovery {
    shared: Arc<Shared>,
    receiver: Arc<SignalReceiver>,
    group: Ipv4Addr,
    port: u16,
    join_timeout: Duration,
    confirm_listener: Mutex<Option<SubscriptionId>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Discovery {
    pub fn new(
        config: &DiscoveryConfig,
        directory: Arc<Directory>,
        broadcaster: Broadcaster,
        receiver: Arc<SignalReceiver>,
        updater: Option<Arc<DirectoryUpdater>>,
    ) -> Result<Self, DiscoveryError> {
        let group = config
            .group_addr()
            .map_err(|_| DiscoveryError::InvalidGroup(config.group.clone()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                broadcaster,
                registrar: Arc::new(PeerRegistrar { directory, updater }),
                permits: Arc::new(Semaphore::new(config.max_inflight.max(1))),
            }),
            receiver,
            group,
            port: config.port,
            join_timeout: config.join_timeout(),
            confirm_listener: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        })
    }

    fn directory(&self) -> &Arc<Directory> {
        &self.shared.registrar.directory
    }

    /// Answer CONFIRM signals; done by `start`, idempotent
    pub fn listen_confirmations(&self) {
        let mut id = self.confirm_listener.lock();
        if id.is_none() {
            let listener = Arc::new(ConfirmListener {
                registrar: self.shared.registrar.clone(),
            });
            *id = Some(
                self.receiver
                    .register_listener(SIGNAL_CONFIRM_BEAT, listener, DEFAULT_PRIORITY),
            );
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Join the group, start listening and send the beacon
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let local_port = self.directory().local_port();
        if local_port == 0 {
            return Err(DiscoveryError::NotReachable);
        }

        self.listen_confirmations();
        let socket = Arc::new(MulticastSocket::open(self.group, self.port)?);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen_loop(
            self.shared.clone(),
            socket.clone(),
            shutdown_rx,
        ));

        let beacon = Packet::Register { port: local_port }.encode();
        let destination = SocketAddr::V4(SocketAddrV4::new(self.group, self.port));
        if let Err(err) = socket.socket.send_to(&beacon, destination).await {
            warn!(%destination, %err, "failed to send discovery beacon");
        }

        info!(group = %self.group, port = self.port, local_port, "discovery started");
        *running = Some(Running {
            socket,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Stop listening and leave the group
    ///
    /// Exchanges already running are left to complete.
    pub async fn stop(&self) {
        if let Some(id) = self.confirm_listener.lock().take() {
            self.receiver.unregister_listener(id);
        }

        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        let mut task = running.task;
        if tokio::time::timeout(self.join_timeout, &mut task).await.is_err() {
            warn!(timeout = ?self.join_timeout, "discovery listener did not stop in time");
            task.abort();
        }

        running.socket.leave();
        info!("discovery stopped");
    }

    /// Handle one datagram received from the group
    ///
    /// Returns the exchange worker started for a beacon, if any. Beacons
    /// arriving while every worker is busy are dropped.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<JoinHandle<()>> {
        handle_datagram(&self.shared, data, from)
    }
}

async fn listen_loop(
    shared: Arc<Shared>,
    socket: Arc<MulticastSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let local_port = shared.registrar.directory.local_port();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if socket.is_local_address(&from.ip()) && beacon_port(&buf[..len]) == Some(local_port) {
                        continue;
                    }
                    handle_datagram(&shared, &buf[..len], from);
                }
                Err(err) => {
                    warn!(%err, "discovery receive failed");
                }
            }
        }
    }
    debug!("discovery listener exited");
}

fn beacon_port(data: &[u8]) -> Option<u16> {
    match Packet::decode(data) {
        Ok(Packet::Register { port }) => Some(port),
        _ => None,
    }
}

fn handle_datagram(shared: &Arc<Shared>, data: &[u8], from: SocketAddr) -> Option<JoinHandle<()>> {
    match Packet::decode(data) {
        Ok(Packet::Register { port }) => {
            let host = from.ip().to_string();
            let Ok(permit) = shared.permits.clone().try_acquire_owned() else {
                warn!(%host, port, "too many confirmations in flight, dropping beacon");
                return None;
            };
            debug!(%host, port, "discovery beacon received");
            let shared = shared.clone();
            Some(tokio::spawn(async move {
                let _permit = permit;
                confirm_beacon(&shared, &host, port).await;
            }))
        }
        Ok(Packet::Unknown { kind }) => {
            debug!(kind, %from, "ignoring discovery packet type");
            None
        }
        Err(err) => {
            warn!(%from, %err, "discarding discovery packet");
            None
        }
    }
}

/// Send our identity to a beacon sender and register its answer
async fn confirm_beacon(shared: &Shared, host: &str, port: u16) {
    let content = ConfirmBeat::local(&shared.registrar.directory).to_value();
    let results = match shared
        .broadcaster
        .send_to(SIGNAL_CONFIRM_BEAT, content, host, port)
        .await
    {
        Ok(results) => results,
        Err(err) => {
            warn!(host, port, %err, "confirmation not delivered");
            return;
        }
    };

    match results.iter().find_map(ConfirmBeat::from_value) {
        Some(beat) => {
            shared.registrar.register_peer(&beat, host, port);
        }
        None => warn!(host, port, "no usable confirmation answer"),
    }
}
