use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::schedule::Destination;

/// Errors from the hop probe send path.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe socket setup failed: {0}")]
    Socket(#[source] std::io::Error),

    #[error("probe send to {destination} failed: {source}")]
    Send {
        destination: IpAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Sends a single hop-limited probe packet and reports its send time.
///
/// Seam between the worker loop and the wire so tests can substitute a
/// recording implementation.
pub trait HopProber: Send + Sync {
    fn probe(
        &self,
        destination: &Destination,
        round: u32,
        ttl: u8,
    ) -> Result<DateTime<Utc>, ProbeError>;
}

/// UDP hop prober bound to one source address.
///
/// Classic UDP-traceroute addressing: the destination port is the base
/// port plus the hop TTL. Reply collection is not this component's job;
/// the engine only needs faithful send timestamps.
pub struct UdpHopProber {
    socket: UdpSocket,
    source: IpAddr,
    base_port: u16,
}

impl UdpHopProber {
    pub fn new(source: IpAddr, base_port: u16) -> Result<Self, ProbeError> {
        let socket = UdpSocket::bind(SocketAddr::new(source, 0)).map_err(ProbeError::Socket)?;

        Ok(Self {
            socket,
            source,
            base_port,
        })
    }

    fn payload(destination: &Destination, round: u32, ttl: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.extend_from_slice(b"PPRB");
        buf.extend_from_slice(&destination.identifier.to_le_bytes());
        buf.extend_from_slice(&round.to_le_bytes());
        buf.push(ttl);
        buf
    }
}

impl HopProber for UdpHopProber {
    fn probe(
        &self,
        destination: &Destination,
        round: u32,
        ttl: u8,
    ) -> Result<DateTime<Utc>, ProbeError> {
        set_hop_limit(&self.socket, self.source.is_ipv6(), ttl).map_err(ProbeError::Socket)?;
        set_traffic_class(&self.socket, self.source.is_ipv6(), destination.traffic_class)
            .map_err(ProbeError::Socket)?;

        let target = SocketAddr::new(destination.address, self.base_port.wrapping_add(ttl as u16));
        let payload = Self::payload(destination, round, ttl);

        let send_time = Utc::now();
        self.socket
            .send_to(&payload, target)
            .map_err(|err| ProbeError::Send {
                destination: destination.address,
                source: err,
            })?;

        Ok(send_time)
    }
}

/// Set the hop limit; std only covers the IPv4 case.
fn set_hop_limit(socket: &UdpSocket, is_v6: bool, ttl: u8) -> std::io::Result<()> {
    if is_v6 {
        setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, ttl.into())
    } else {
        socket.set_ttl(u32::from(ttl))
    }
}

/// Set the DSCP/TOS byte (IP_TOS / IPV6_TCLASS).
fn set_traffic_class(socket: &UdpSocket, is_v6: bool, traffic_class: u8) -> std::io::Result<()> {
    if is_v6 {
        setsockopt_int(socket, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, traffic_class.into())
    } else {
        setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_TOS, traffic_class.into())
    }
}

fn setsockopt_int(
    socket: &UdpSocket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    // SAFETY: the fd is owned by `socket` and stays open for the call; the
    // value buffer is a live c_int on the stack.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
