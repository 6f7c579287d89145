//! Transport event definitions

use std::net::SocketAddr;
use std::sync::Arc;

use rsip::{Request, Response};

/// Which listener a message arrived on or should leave through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Tls => write!(f, "tls"),
        }
    }
}

/// A parsed SIP message together with the endpoints it travelled between.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    RequestReceived {
        request: Arc<Request>,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportKind,
    },
    ResponseReceived {
        response: Arc<Response>,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportKind,
    },
}

impl TransportEvent {
    pub fn remote(&self) -> SocketAddr {
        match self {
            TransportEvent::RequestReceived { remote, .. } => *remote,
            TransportEvent::ResponseReceived { remote, .. } => *remote,
        }
    }
}
