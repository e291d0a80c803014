//! Multicast socket setup

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::DiscoveryError;

/// A UDP socket bound to the discovery port and member of the group
pub(crate) struct MulticastSocket {
    pub(crate) socket: UdpSocket,
    group: Ipv4Addr,
    interfaces: Vec<Ipv4Addr>,
}

impl MulticastSocket {
    /// Bind the port and join the group on every IPv4 interface
    pub(crate) fn open(group: Ipv4Addr, port: u16) -> Result<Self, DiscoveryError> {
        if !group.is_multicast() {
            return Err(DiscoveryError::InvalidGroup(group.to_string()));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

        let mut interfaces = Vec::new();
        for interface in ipv4_interfaces() {
            match socket.join_multicast_v4(&group, &interface) {
                Ok(()) => interfaces.push(interface),
                Err(err) => debug!(%interface, %err, "interface can't join multicast group"),
            }
        }
        if interfaces.is_empty() {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }
        debug!(%group, port, ?interfaces, "multicast group joined");

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            group,
            interfaces,
        })
    }

    /// Whether the address is one of this host's joined interfaces
    pub(crate) fn is_local_address(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => v4.is_loopback() || self.interfaces.contains(v4),
            IpAddr::V6(v6) => v6.is_loopback(),
        }
    }

    /// Leave the group on every joined interface
    pub(crate) fn leave(&self) {
        for interface in &self.interfaces {
            if let Err(err) = self.socket.leave_multicast_v4(self.group, *interface) {
                warn!(%interface, %err, "failed to leave multicast group");
            }
        }
    }
}

fn ipv4_interfaces() -> Vec<Ipv4Addr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            let mut addrs: Vec<Ipv4Addr> = interfaces
                .into_iter()
                .filter_map(|(_, addr)| match addr {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            addrs.sort();
            addrs.dedup();
            addrs
        }
        Err(err) => {
            warn!(%err, "can't list network interfaces");
            Vec::new()
        }
    }
}
