//! Server configuration
//!
//! Loaded from an optional JSON file and overridable from the command
//! line. Validation happens once at boot; a bad config kills the process
//! before any socket is bound.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use signalrtc_sip_transport::{ContactPolicy, Subnet};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP/TCP SIP listening port.
    pub sip_listen_port: u16,
    /// TLS SIP listening port.
    pub sip_tls_listen_port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    /// Contact-rewrite targets for NAT'd / load-balanced deployments.
    pub public_contact_hostname: Option<String>,
    pub public_contact_ipv4: Option<Ipv4Addr>,
    pub public_contact_ipv6: Option<Ipv6Addr>,

    /// CIDRs exempt from Contact rewriting and abuse counting.
    pub private_subnets: Vec<String>,

    /// Default domain, seeded when the domain table is empty.
    pub sip_domain: Option<String>,

    /// Operator user ids granted the admin role on login.
    pub admins: Vec<String>,

    pub database_url: String,
    pub http_listen_addr: SocketAddr,
    pub worker_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sip_listen_port: 5060,
            sip_tls_listen_port: 5061,
            tls_cert_path: None,
            tls_key_path: None,
            public_contact_hostname: None,
            public_contact_ipv4: None,
            public_contact_ipv6: None,
            private_subnets: Vec::new(),
            sip_domain: None,
            admins: Vec::new(),
            database_url: "sqlite:signalrtc.db?mode=rwc".to_string(),
            http_listen_addr: "0.0.0.0:8080".parse().expect("static addr"),
            worker_count: 4,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for subnet in &self.private_subnets {
            if Subnet::parse(subnet).is_none() {
                anyhow::bail!("invalid private subnet: {}", subnet);
            }
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("tls_cert_path and tls_key_path must be set together");
        }
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }
        Ok(())
    }

    pub fn parsed_subnets(&self) -> Vec<Subnet> {
        self.private_subnets
            .iter()
            .filter_map(|text| Subnet::parse(text))
            .collect()
    }

    pub fn contact_policy(&self) -> ContactPolicy {
        ContactPolicy {
            public_hostname: self.public_contact_hostname.clone(),
            public_ipv4: self.public_contact_ipv4,
            public_ipv6: self.public_contact_ipv6,
            private_subnets: self.parsed_subnets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_subnet_rejected() {
        let config = ServerConfig {
            private_subnets: vec!["10.0.0.0/33".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn half_configured_tls_rejected() {
        let config = ServerConfig {
            tls_cert_path: Some("/etc/cert.pem".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_roundtrip() {
        let text = r#"{
            "sip_listen_port": 5070,
            "public_contact_ipv4": "203.0.113.10",
            "private_subnets": ["10.0.0.0/8"],
            "sip_domain": "192.168.0.50"
        }"#;
        let config: ServerConfig = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sip_listen_port, 5070);
        assert_eq!(config.sip_tls_listen_port, 5061);
        assert_eq!(config.parsed_subnets().len(), 1);
        let policy = config.contact_policy();
        assert_eq!(policy.public_ipv4, Some("203.0.113.10".parse().unwrap()));
    }
}
