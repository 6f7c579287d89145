//! Contact header rewriting for NAT / load-balancer topologies.
//!
//! Hosts deployed behind a public load balancer advertise a private socket
//! in their Contact header. Before a message leaves toward a non-private
//! destination, the host field is replaced with the configured public
//! address that matches the destination's address family.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rsip::common::uri::Scheme;
use rsip::host_with_port::Host;
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{Method, SipMessage};
use tracing::trace;

/// An IPv4/IPv6 CIDR block, e.g. `10.0.0.0/8` or `fd00::/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn parse(text: &str) -> Option<Self> {
        let (addr, prefix) = text.split_once('/')?;
        let network: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, canonical_ip(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Collapse IPv4-mapped IPv6 addresses so family checks see the real peer.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// True for addresses that never need a public Contact: RFC 1918 ranges,
/// loopback, link-local and unique-local v6.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match canonical_ip(ip) {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local, fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Public-address configuration driving the rewrite.
#[derive(Debug, Clone, Default)]
pub struct ContactPolicy {
    pub public_hostname: Option<String>,
    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,
    pub private_subnets: Vec<Subnet>,
}

impl ContactPolicy {
    pub fn is_configured(&self) -> bool {
        self.public_hostname.is_some() || self.public_ipv4.is_some() || self.public_ipv6.is_some()
    }

    /// True when the destination should see the server's internal Contact
    /// untouched: private/loopback ranges plus any configured subnet.
    pub fn is_private_destination(&self, ip: IpAddr) -> bool {
        is_private_ip(ip) || self.private_subnets.iter().any(|net| net.contains(ip))
    }
}

/// Rewrite the Contact host of an outgoing message when it carries a single
/// Contact, its CSeq method is INVITE or OPTIONS, and the destination is not
/// private.
pub fn customise(policy: &ContactPolicy, message: &mut SipMessage, destination: SocketAddr) {
    if !policy.is_configured() || policy.is_private_destination(destination.ip()) {
        return;
    }

    let (headers, cseq_method) = match message {
        SipMessage::Request(req) => {
            let method = match req.cseq_header().and_then(|h| h.typed()) {
                Ok(cseq) => cseq.method,
                Err(_) => return,
            };
            (&mut req.headers, method)
        }
        SipMessage::Response(resp) => {
            let method = match resp.cseq_header().and_then(|h| h.typed()) {
                Ok(cseq) => cseq.method,
                Err(_) => return,
            };
            (&mut resp.headers, method)
        }
    };

    if !matches!(cseq_method, Method::Invite | Method::Options) {
        return;
    }

    let mut contacts: Vec<&mut rsip::headers::Contact> = headers
        .iter_mut()
        .filter_map(|header| match header {
            rsip::Header::Contact(contact) => Some(contact),
            _ => None,
        })
        .collect();
    // Multiple Contact headers mean a REGISTER-style list; leave those alone.
    if contacts.len() != 1 {
        return;
    }

    let contact = contacts.remove(0);
    let Ok(mut typed) = contact.clone().typed() else {
        return;
    };

    let is_tls = typed.uri.scheme == Some(Scheme::Sips);
    let destination_ip = canonical_ip(destination.ip());

    let new_host = if is_tls && policy.public_hostname.is_some() {
        policy
            .public_hostname
            .clone()
            .map(|name| Host::Domain(name.into()))
    } else if destination_ip.is_ipv4() && policy.public_ipv4.is_some() {
        policy.public_ipv4.map(|ip| Host::IpAddr(IpAddr::V4(ip)))
    } else if destination_ip.is_ipv6() && policy.public_ipv6.is_some() {
        policy.public_ipv6.map(|ip| Host::IpAddr(IpAddr::V6(ip)))
    } else {
        policy
            .public_hostname
            .clone()
            .map(|name| Host::Domain(name.into()))
    };

    let Some(host) = new_host else {
        return;
    };

    // Port 0 means "let the transport decide"; drop it so the peer uses the
    // scheme default.
    let port = typed
        .uri
        .host_with_port
        .port
        .filter(|port| *port.value() != 0);

    typed.uri.host_with_port.host = host;
    typed.uri.host_with_port.port = port;

    trace!(uri = %typed.uri, dst = %destination, "contact rewritten");
    *contact = typed.into();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn invite_with_contact(contact: &str) -> SipMessage {
        let raw = format!(
            "INVITE sip:100@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK776\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:caller@example.com>;tag=a1\r\n\
             To: <sip:100@example.com>\r\n\
             Call-ID: cid-1@10.0.0.2\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: {}\r\n\
             Content-Length: 0\r\n\r\n",
            contact
        );
        SipMessage::try_from(raw.as_str()).unwrap()
    }

    fn policy() -> ContactPolicy {
        ContactPolicy {
            public_hostname: Some("sip.signalrtc.example".into()),
            public_ipv4: Some(Ipv4Addr::new(203, 0, 113, 10)),
            public_ipv6: Some("2001:db8::10".parse().unwrap()),
            private_subnets: vec![Subnet::parse("100.64.0.0/10").unwrap()],
        }
    }

    fn contact_line(message: &SipMessage) -> String {
        let text = message.to_string();
        text.lines()
            .find(|line| line.starts_with("Contact"))
            .unwrap()
            .to_string()
    }

    #[test]
    fn rewrites_v4_destination_to_public_v4() {
        let mut msg = invite_with_contact("<sip:user@10.0.0.2:5060>");
        customise(&policy(), &mut msg, "198.51.100.7:5060".parse().unwrap());
        assert!(contact_line(&msg).contains("203.0.113.10:5060"));
    }

    #[test]
    fn private_destination_untouched() {
        let mut msg = invite_with_contact("<sip:user@10.0.0.2:5060>");
        customise(&policy(), &mut msg, "192.168.1.20:5060".parse().unwrap());
        assert!(contact_line(&msg).contains("10.0.0.2:5060"));
    }

    #[test]
    fn configured_subnet_untouched() {
        let mut msg = invite_with_contact("<sip:user@10.0.0.2:5060>");
        customise(&policy(), &mut msg, "100.64.1.1:5060".parse().unwrap());
        assert!(contact_line(&msg).contains("10.0.0.2:5060"));
    }

    #[test]
    fn zero_port_dropped() {
        let mut msg = invite_with_contact("<sip:user@10.0.0.2:0>");
        customise(&policy(), &mut msg, "198.51.100.7:5060".parse().unwrap());
        let line = contact_line(&msg);
        assert!(line.contains("203.0.113.10"));
        assert!(!line.contains(":0"));
    }

    #[test]
    fn sips_scheme_prefers_hostname() {
        let mut msg = invite_with_contact("<sips:user@10.0.0.2:5061>");
        customise(&policy(), &mut msg, "198.51.100.7:5061".parse().unwrap());
        assert!(contact_line(&msg).contains("sip.signalrtc.example"));
    }

    #[test]
    fn non_invite_cseq_untouched() {
        let raw = "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK1\r\n\
             From: <sip:user@example.com>;tag=a1\r\n\
             To: <sip:user@example.com>\r\n\
             Call-ID: cid-2@10.0.0.2\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:user@10.0.0.2:5060>\r\n\
             Content-Length: 0\r\n\r\n";
        let mut msg = SipMessage::try_from(raw).unwrap();
        customise(&policy(), &mut msg, "198.51.100.7:5060".parse().unwrap());
        assert!(contact_line(&msg).contains("10.0.0.2:5060"));
    }

    #[test]
    fn subnet_matching() {
        let net = Subnet::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.200.3.4".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(Subnet::parse("10.0.0.0/33").is_none());
    }
}
