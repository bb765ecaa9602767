pub mod chromecast;
pub mod discovery;

pub use chromecast::{CastChannel, CastConnector, LoadRequest, RemotePlayerState, RustCastConnector};
pub use discovery::{DeviceScanner, DiscoveryPass, CAST_SERVICE_TYPE, DEFAULT_CAST_PORT};

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Outbound LAN address of this host, as seen by other devices on the network.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick the
/// interface a packet to that destination would leave from.
pub fn local_lan_address() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!("Could not determine LAN address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
