//! UDP listener for SIP datagrams

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::{Error, Result};

// Buffer size for receiving datagrams
const UDP_BUFFER_SIZE: usize = 8_192;

/// UDP listener for receiving SIP messages
pub struct UdpListener {
    socket: Arc<UdpSocket>,
}

impl UdpListener {
    /// Binds the UDP listener to the specified address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::BindFailed(addr, e))?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Returns a cloned Arc to the underlying socket
    pub fn clone_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Returns the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::LocalAddrFailed)
    }

    /// Receives a datagram from the socket
    pub async fn receive(&self) -> Result<(bytes::Bytes, SocketAddr)> {
        let mut buffer = BytesMut::with_capacity(UDP_BUFFER_SIZE);
        buffer.resize(UDP_BUFFER_SIZE, 0);

        let (len, src) = self
            .socket
            .recv_from(&mut buffer)
            .await
            .map_err(Error::ReceiveFailed)?;

        buffer.truncate(len);
        trace!(bytes = len, src = %src, "udp datagram received");
        Ok((buffer.freeze(), src))
    }

    /// Sends a datagram to the destination
    pub async fn send(&self, payload: &[u8], dst: SocketAddr) -> Result<()> {
        self.socket
            .send_to(payload, dst)
            .await
            .map_err(|e| Error::SendFailed(dst, e))?;
        Ok(())
    }
}
