//! Transport manager: owns every listening socket and the send paths.
//!
//! Incoming datagrams and stream segments are parsed with rsip and published
//! as [`TransportEvent`]s on a broadcast channel; consumers subscribe and
//! never touch sockets. Outgoing messages pass through the Contact
//! customiser before serialisation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use rsip::SipMessage;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contact::{customise, ContactPolicy};
use crate::error::{Error, Result};
use crate::events::{TransportEvent, TransportKind};
use crate::transport::tcp::{read_message, write_message, TcpListener};
use crate::transport::tls::build_acceptor;
use crate::transport::udp::UdpListener;
use crate::transport::INITIAL_BUFFER_SIZE;

const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const CONNECTION_WRITE_QUEUE: usize = 32;

/// Socket configuration for the adapter.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub sip_port: u16,
    pub sip_tls_port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub contact: ContactPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sip_port: 5060,
            sip_tls_port: 5061,
            tls_cert_path: None,
            tls_key_path: None,
            contact: ContactPolicy::default(),
        }
    }
}

type ConnectionKey = (TransportKind, SocketAddr);

/// Owns the UDP/TCP/TLS listeners and the live stream connections.
pub struct TransportManager {
    udp_v4: Option<Arc<UdpSocket>>,
    udp_v6: Option<Arc<UdpSocket>>,
    udp_v4_addr: Option<SocketAddr>,
    udp_v6_addr: Option<SocketAddr>,
    connections: Arc<DashMap<ConnectionKey, mpsc::Sender<Vec<u8>>>>,
    events: broadcast::Sender<TransportEvent>,
    contact: ContactPolicy,
    cancel: CancellationToken,
    tls_handshake_failures: Arc<AtomicU64>,
}

impl TransportManager {
    /// Bind every configured listener and start its receive loop.
    ///
    /// A family that fails to bind is skipped with a warning; init only
    /// fails when no UDP socket could be bound at all.
    pub async fn bind(config: TransportConfig) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let connections = Arc::new(DashMap::new());
        let tls_handshake_failures = Arc::new(AtomicU64::new(0));

        let mut udp_v4 = None;
        let mut udp_v4_addr = None;
        let mut udp_v6 = None;
        let mut udp_v6_addr = None;

        let binds = [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sip_port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.sip_port),
        ];
        for addr in binds {
            match UdpListener::bind(addr).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!(%local, "udp listener bound");
                    if addr.is_ipv4() {
                        udp_v4 = Some(listener.clone_socket());
                        udp_v4_addr = Some(local);
                    } else {
                        udp_v6 = Some(listener.clone_socket());
                        udp_v6_addr = Some(local);
                    }
                    spawn_udp_loop(listener, local, events.clone(), cancel.clone());
                }
                Err(err) => warn!(%addr, error = %err, "udp bind skipped"),
            }
        }

        if udp_v4.is_none() && udp_v6.is_none() {
            return Err(Error::NoListeners);
        }

        for addr in [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sip_port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.sip_port),
        ] {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!(%local, "tcp listener bound");
                    spawn_tcp_accept_loop(
                        listener,
                        local,
                        events.clone(),
                        connections.clone(),
                        cancel.clone(),
                    );
                }
                Err(err) => warn!(%addr, error = %err, "tcp bind skipped"),
            }
        }

        if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
            match build_acceptor(cert, key) {
                Ok(acceptor) => {
                    for addr in [
                        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sip_tls_port),
                        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.sip_tls_port),
                    ] {
                        match TcpListener::bind(addr).await {
                            Ok(listener) => {
                                let local = listener.local_addr()?;
                                info!(%local, "tls listener bound");
                                spawn_tls_accept_loop(
                                    listener,
                                    acceptor.clone(),
                                    local,
                                    events.clone(),
                                    connections.clone(),
                                    cancel.clone(),
                                    tls_handshake_failures.clone(),
                                );
                            }
                            Err(err) => warn!(%addr, error = %err, "tls bind skipped"),
                        }
                    }
                }
                Err(err) => warn!(error = %err, "tls acceptor unavailable, tls disabled"),
            }
        } else {
            info!("no tls certificate configured, tls listener disabled");
        }

        Ok(Arc::new(Self {
            udp_v4,
            udp_v6,
            udp_v4_addr,
            udp_v6_addr,
            connections,
            events,
            contact: config.contact,
            cancel,
            tls_handshake_failures,
        }))
    }

    /// Subscribe to parsed request/response events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// The UDP socket address a peer of the given family should be told
    /// about (Via/Contact construction, binding rows).
    pub fn local_udp_addr(&self, remote: SocketAddr) -> Option<SocketAddr> {
        if remote.is_ipv4() {
            self.udp_v4_addr.or(self.udp_v6_addr)
        } else {
            self.udp_v6_addr.or(self.udp_v4_addr)
        }
    }

    pub fn contact_policy(&self) -> &ContactPolicy {
        &self.contact
    }

    /// TLS handshakes that failed since start. Counted, never banned here.
    pub fn tls_handshake_failures(&self) -> u64 {
        self.tls_handshake_failures.load(Ordering::Relaxed)
    }

    pub async fn send_request(
        &self,
        request: rsip::Request,
        dst: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        self.send(SipMessage::Request(request), dst, transport).await
    }

    pub async fn send_response(
        &self,
        response: rsip::Response,
        dst: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        self.send(SipMessage::Response(response), dst, transport)
            .await
    }

    async fn send(
        &self,
        mut message: SipMessage,
        dst: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        customise(&self.contact, &mut message, dst);
        let payload = message.to_string().into_bytes();

        match transport {
            TransportKind::Udp => {
                let socket = if dst.is_ipv4() {
                    self.udp_v4.as_ref().or(self.udp_v6.as_ref())
                } else {
                    self.udp_v6.as_ref().or(self.udp_v4.as_ref())
                }
                .ok_or(Error::TransportClosed)?;
                socket
                    .send_to(&payload, dst)
                    .await
                    .map_err(|e| Error::SendFailed(dst, e))?;
                Ok(())
            }
            TransportKind::Tcp | TransportKind::Tls => {
                let sender = self
                    .connections
                    .get(&(transport, dst))
                    .map(|entry| entry.value().clone())
                    .ok_or(Error::NoConnection(dst))?;
                sender.send(payload).await.map_err(|_| Error::ChannelClosed)
            }
        }
    }

    /// Stop every listener and connection task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.connections.clear();
    }
}

fn publish(
    payload: &[u8],
    local: SocketAddr,
    remote: SocketAddr,
    transport: TransportKind,
    events: &broadcast::Sender<TransportEvent>,
) {
    // CRLF keepalives are normal UA behavior, not a parse failure.
    if payload.iter().all(|byte| byte.is_ascii_whitespace()) {
        return;
    }

    match SipMessage::try_from(payload) {
        Ok(SipMessage::Request(request)) => {
            let _ = events.send(TransportEvent::RequestReceived {
                request: Arc::new(request),
                local,
                remote,
                transport,
            });
        }
        Ok(SipMessage::Response(response)) => {
            let _ = events.send(TransportEvent::ResponseReceived {
                response: Arc::new(response),
                local,
                remote,
                transport,
            });
        }
        Err(err) => {
            debug!(%remote, %transport, error = %err, "unparseable message dropped");
        }
    }
}

fn spawn_udp_loop(
    listener: UdpListener,
    local: SocketAddr,
    events: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = listener.receive() => match received {
                    Ok((payload, remote)) => {
                        publish(&payload, local, remote, TransportKind::Udp, &events);
                    }
                    Err(err) => {
                        // A single bad datagram must not kill the listener.
                        warn!(%local, error = %err, "udp receive error");
                    }
                }
            }
        }
        debug!(%local, "udp loop stopped");
    });
}

fn spawn_tcp_accept_loop(
    listener: TcpListener,
    local: SocketAddr,
    events: broadcast::Sender<TransportEvent>,
    connections: Arc<DashMap<ConnectionKey, mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_stream_tasks(
                            stream,
                            TransportKind::Tcp,
                            local,
                            peer,
                            events.clone(),
                            connections.clone(),
                            cancel.clone(),
                        );
                    }
                    Err(err) => warn!(%local, error = %err, "tcp accept error"),
                }
            }
        }
        debug!(%local, "tcp accept loop stopped");
    });
}

fn spawn_tls_accept_loop(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    local: SocketAddr,
    events: broadcast::Sender<TransportEvent>,
    connections: Arc<DashMap<ConnectionKey, mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
    handshake_failures: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let acceptor = acceptor.clone();
                        let events = events.clone();
                        let connections = connections.clone();
                        let cancel = cancel.clone();
                        let failures = handshake_failures.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    spawn_stream_tasks(
                                        tls_stream,
                                        TransportKind::Tls,
                                        local,
                                        peer,
                                        events,
                                        connections,
                                        cancel,
                                    );
                                }
                                Err(err) => {
                                    failures.fetch_add(1, Ordering::Relaxed);
                                    warn!(%peer, error = %err, "tls handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => warn!(%local, error = %err, "tls accept error"),
                }
            }
        }
        debug!(%local, "tls accept loop stopped");
    });
}

fn spawn_stream_tasks<S>(
    stream: S,
    transport: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    events: broadcast::Sender<TransportEvent>,
    connections: Arc<DashMap<ConnectionKey, mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CONNECTION_WRITE_QUEUE);
    connections.insert((transport, peer), tx);

    // Writer task: drains queued sends until the connection goes away.
    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => {
                        if let Err(err) = write_message(&mut writer, &payload, peer).await {
                            warn!(%peer, error = %err, "stream write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    // Reader task: frames and publishes until EOF or error.
    tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_message(&mut reader, &mut buffer) => match read {
                    Ok(Some(message)) => {
                        publish(&message, local, peer, transport, &events);
                    }
                    Ok(None) => {
                        debug!(%peer, %transport, "connection closed by peer");
                        break;
                    }
                    Err(err) => {
                        warn!(%peer, %transport, error = %err, "stream read failed");
                        break;
                    }
                }
            }
        }
        connections.remove(&(transport, peer));
    });
}
