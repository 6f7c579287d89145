//! SIP transport adapter for signalrtc.
//!
//! Binds UDP, TCP and TLS listeners on v4-any and v6-any, parses inbound
//! traffic with rsip and fans the results out as [`TransportEvent`]s.
//! Outgoing INVITE/OPTIONS traffic is run through the Contact customiser so
//! NAT'd and load-balanced deployments advertise reachable addresses.

pub mod contact;
pub mod error;
pub mod events;
pub mod manager;
pub mod reply;
pub mod transport;

pub use contact::{customise, is_private_ip, ContactPolicy, Subnet};
pub use error::{Error, Result};
pub use events::{TransportEvent, TransportKind};
pub use manager::{TransportConfig, TransportManager};
pub use reply::{
    new_branch, new_tag, response_for, response_with_body, transaction_key, SERVER_NAME,
};
