//! REGISTER and SUBSCRIBE processing for signalrtc.
//!
//! Holds the binding manager (durable contact registrations with an expiry
//! sweep), the registrar worker pool, digest authentication against stored
//! HA1 digests, and the subscriber core that answers message-summary
//! subscriptions with a dummy NOTIFY.

pub mod auth;
pub mod bindings;
pub mod error;
pub mod events;
pub mod queue;
pub mod registrar;
pub mod subscriber;
pub mod types;

pub use auth::{AuthOutcome, DigestAuthenticator};
pub use bindings::{BindingStore, BindingUpdate, ContactRegistration};
pub use error::{RegistrarError, Result};
pub use events::{RegisterFailure, RegisterFailureHooks, RegisterFailureReason};
pub use queue::WorkQueue;
pub use registrar::{request_uri_is_ip, RegisterJob, RegistrarCore};
pub use subscriber::{SubscribeJob, SubscriberCore};
pub use types::{Binding, RegistrarConfig};
