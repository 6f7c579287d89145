//! TCP listener and per-connection read/write tasks

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::net::TcpStream;
use tracing::trace;

use super::{extract_message, INITIAL_BUFFER_SIZE, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};

/// Accepting side of the TCP transport
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| Error::BindFailed(addr, e))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::LocalAddrFailed)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await.map_err(Error::ReceiveFailed)
    }
}

/// Read one framed SIP message from a stream, buffering partial reads.
///
/// Returns `Ok(None)` on orderly close. Works over plain TCP and TLS
/// streams alike.
pub async fn read_message<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(message) = extract_message(buffer) {
            return Ok(Some(message));
        }
        if buffer.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(buffer.len()));
        }

        let mut chunk = [0u8; INITIAL_BUFFER_SIZE];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(Error::ReceiveFailed)?;
        if read == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..read]);
        trace!(bytes = read, "stream bytes buffered");
    }
}

/// Write a serialised message to a stream and flush it.
pub async fn write_message<S>(stream: &mut S, payload: &[u8], peer: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::SendFailed(peer, e))?;
    stream.flush().await.map_err(|e| Error::SendFailed(peer, e))
}
