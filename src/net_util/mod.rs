//! Socket construction and UDP send helpers.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Bind a UDP socket with `SO_REUSEADDR` set, and optionally with
/// broadcast permitted, and register it with the tokio reactor.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// If the socket cannot be created, configured, or bound.
pub fn bind_udp(addr: SocketAddrV4, broadcast: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Write a serialised message to a UDP channel, addressed to
/// `target`.  This sets or clears the TC flag as appropriate: a
/// message over 512 octets is truncated rather than refused.
///
/// # Errors
///
/// If the send fails.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    if bytes.len() < 12 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message shorter than a DNS header",
        ));
    }

    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..512], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn bind_udp_binds_and_reports_an_address() {
        let socket = bind_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(0, addr.port());
    }

    #[tokio::test]
    async fn send_rejects_headerless_buffers() {
        let socket = bind_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false).unwrap();
        let target = socket.local_addr().unwrap();

        let mut bytes = [0u8; 4];
        assert!(send_udp_bytes_to(&socket, target, &mut bytes)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn send_truncates_oversized_messages() {
        let sender = bind_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false).unwrap();
        let receiver = bind_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false).unwrap();
        let target = receiver.local_addr().unwrap();

        let mut bytes = vec![0u8; 600];
        send_udp_bytes_to(&sender, target, &mut bytes).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (size, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(512, size);
        assert_eq!(0b0000_0010, buf[2] & 0b0000_0010); // TC set
    }
}
