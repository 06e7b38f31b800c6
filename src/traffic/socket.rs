use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use socket2::SockRef;
use tracing::{debug, warn};

use super::stream::{Profile, Role, StreamParams};

/// Local address a stream binds to. Receivers listen on the destination
/// port; senders use the source address and port.
pub fn bind_addr(p: &StreamParams) -> SocketAddr {
    match p.role {
        Role::Receiver => SocketAddr::from((Ipv4Addr::UNSPECIFIED, p.dst_port)),
        Role::Sender => SocketAddr::from((p.src, p.src_port)),
    }
}

pub fn open_stream_socket(p: &StreamParams) -> io::Result<UdpSocket> {
    let addr = bind_addr(p);
    let sock = UdpSocket::bind(addr)?;

    if p.role == Role::Receiver && p.profile == Profile::Multicast {
        let iface = if p.src.is_unspecified() {
            Ipv4Addr::UNSPECIFIED
        } else {
            p.src
        };
        sock.join_multicast_v4(&p.dst, &iface)?;
        debug!(group = %p.dst, %iface, "joined multicast group");
    }

    let tos = p.tos();
    if tos != 0
        && let Err(e) = set_tos(&sock, tos)
    {
        warn!(tos, error = %e, "cannot set IP_TOS");
    }
    Ok(sock)
}

fn set_tos(sock: &UdpSocket, tos: u8) -> io::Result<()> {
    SockRef::from(sock).set_tos(u32::from(tos))
}
