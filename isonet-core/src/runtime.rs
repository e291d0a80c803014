//! Component bootstrap
//!
//! Components are built in dependency order (directory, receiver,
//! broadcaster, updater, discovery) and stopped in reverse order. Building
//! and starting are separate so the receiver endpoint can be served in
//! between.

use isonet_types::HostAccess;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::IsonetConfig;
use crate::directory::Directory;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::receiver::SignalReceiver;
use crate::transport::SignalTransport;
use crate::updater::DirectoryUpdater;

/// A running isonet stack
pub struct Isonet {
    config: IsonetConfig,
    directory: Arc<Directory>,
    receiver: Arc<SignalReceiver>,
    broadcaster: Broadcaster,
    updater: Option<Arc<DirectoryUpdater>>,
    discovery: Option<Discovery>,
}

impl Isonet {
    /// Build every component without touching the network
    ///
    /// `receiver_port` is the port inbound signals are accepted on; it must
    /// be bound before [`start`](Self::start) so that discovery can
    /// announce it and handshake replies can come back.
    pub fn new(
        mut config: IsonetConfig,
        receiver_port: u16,
        transports: Vec<Arc<dyn SignalTransport>>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.resolve_identity();
        info!(uid = %identity.uid, name = %identity.name, node = %identity.node, "building isolate");

        let directory = Arc::new(Directory::new(identity));
        directory.set_local_port(receiver_port);

        let receiver = Arc::new(SignalReceiver::new());
        if receiver_port != 0 {
            receiver.set_access_info(HostAccess::new(local_host(), receiver_port));
        }

        let broadcaster = Broadcaster::new(
            directory.clone(),
            receiver.clone(),
            transports,
            &config.broadcaster,
        );

        let updater = config.updater.enabled.then(|| {
            DirectoryUpdater::new(
                &config.updater,
                directory.clone(),
                broadcaster.clone(),
                receiver.clone(),
            )
        });

        let discovery = if config.discovery.enabled {
            Some(Discovery::new(
                &config.discovery,
                directory.clone(),
                broadcaster.clone(),
                receiver.clone(),
                updater.clone(),
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            directory,
            receiver,
            broadcaster,
            updater,
            discovery,
        })
    }

    /// Start the updater, grab the configured dump then start discovery
    pub async fn start(&self) -> Result<()> {
        if let Some(updater) = &self.updater {
            updater.start();
            if let Some((host, port)) = self.config.updater.dump_source_addr()? {
                if let Err(err) = updater.grab_directory(&host, port, None).await {
                    warn!(%host, port, %err, "initial directory grab failed");
                }
            }
        }
        if let Some(discovery) = &self.discovery {
            discovery.start().await?;
        }
        info!(uid = %self.directory.local_uid(), port = self.directory.local_port(), "isolate started");
        Ok(())
    }

    /// Build and start in one go
    pub async fn launch(
        config: IsonetConfig,
        receiver_port: u16,
        transports: Vec<Arc<dyn SignalTransport>>,
    ) -> Result<Self> {
        let isonet = Self::new(config, receiver_port, transports)?;
        isonet.start().await?;
        Ok(isonet)
    }

    /// Stop the components in reverse order
    pub async fn stop(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        if let Some(updater) = &self.updater {
            updater.stop();
        }
        info!(uid = %self.directory.local_uid(), "isolate stopped");
    }

    /// Configuration with the identity resolved
    pub fn config(&self) -> &IsonetConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn receiver(&self) -> &Arc<SignalReceiver> {
        &self.receiver
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn updater(&self) -> Option<&Arc<DirectoryUpdater>> {
        self.updater.as_ref()
    }

    pub fn discovery(&self) -> Option<&Discovery> {
        self.discovery.as_ref()
    }
}

/// Address other hosts can reach this one on, falling back to loopback
pub fn local_host() -> String {
    local_ip_address::local_ip()
        .or_else(|_| local_ip_address::local_ipv6())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
        .to_string()
}
