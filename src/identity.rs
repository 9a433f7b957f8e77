//! Node identity
//!
//! A node is known to the monitor and to batch result collectors as
//! `address` or `address_instance`, e.g. `10.0.0.1_appOne`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Identifier of a bitarchive node, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    address: IpAddr,
    instance: Option<String>,
}

impl NodeIdentity {
    /// Build an identity from an explicit address and optional instance id.
    ///
    /// An empty instance id is treated as absent.
    #[must_use]
    pub fn new(address: IpAddr, instance: Option<&str>) -> Self {
        Self {
            address,
            instance: instance.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Build an identity from the address of this host's outbound interface.
    ///
    /// Falls back to the loopback address when no route can be resolved.
    #[must_use]
    pub fn detect(instance: Option<&str>) -> Self {
        let address = outbound_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        if instance.map_or(true, str::is_empty) {
            tracing::warn!("No application instance id configured; identity is the bare host address");
        }
        Self::new(address, instance)
    }

    /// Host address part
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Instance suffix, if any
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}_{instance}", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

// Connecting a UDP socket sends nothing; it only asks the kernel to pick a route.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
