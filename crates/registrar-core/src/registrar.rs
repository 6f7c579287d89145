//! REGISTER processing: bounded queue, worker pool, authentication and
//! binding mutation.

use std::net::SocketAddr;
use std::sync::Arc;

use rsip::headers::ToTypedHeader;
use rsip::host_with_port::Host;
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Method, Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use signalrtc_sip_transport::{response_for, TransportKind, TransportManager};
use signalrtc_users_core::{Account, DirectoryStore, Domain, DomainRegistry};

use crate::auth::{AuthOutcome, DigestAuthenticator};
use crate::bindings::{BindingStore, BindingUpdate, ContactRegistration};
use crate::error::{RegistrarError, Result};
use crate::events::{RegisterFailure, RegisterFailureHooks, RegisterFailureReason};
use crate::queue::WorkQueue;
use crate::types::{Binding, RegistrarConfig};

/// One REGISTER waiting for a worker.
#[derive(Debug, Clone)]
pub struct RegisterJob {
    pub request: Arc<Request>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: TransportKind,
}

/// The registrar service.
pub struct RegistrarCore {
    queue: Arc<WorkQueue<RegisterJob>>,
    transport: Arc<TransportManager>,
    directory: Arc<dyn DirectoryStore>,
    domains: Arc<DomainRegistry>,
    bindings: Arc<BindingStore>,
    authenticator: Arc<DigestAuthenticator>,
    failures: RegisterFailureHooks,
    config: RegistrarConfig,
    cancel: CancellationToken,
}

impl RegistrarCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RegistrarConfig,
        transport: Arc<TransportManager>,
        directory: Arc<dyn DirectoryStore>,
        domains: Arc<DomainRegistry>,
        bindings: Arc<BindingStore>,
        authenticator: Arc<DigestAuthenticator>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(WorkQueue::new(config.max_register_queue)),
            transport,
            directory,
            domains,
            bindings,
            authenticator,
            failures: RegisterFailureHooks::default(),
            config,
            cancel,
        })
    }

    /// Subscribe to non-authenticated REGISTER outcomes.
    pub fn on_register_failure(
        &self,
        hook: Arc<dyn Fn(&RegisterFailure) + Send + Sync>,
    ) {
        self.failures.subscribe(hook);
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        for worker in 0..self.config.worker_count {
            let core = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = core.cancel.cancelled() => break,
                        job = core.queue.pop() => {
                            let Some(job) = job else { break };
                            if let Err(err) = core.process(&job).await {
                                // The worker survives; the UA gets a final status.
                                error!(worker, error = %err, "register processing failed");
                                let status = match err {
                                    RegistrarError::BadRequest(_) => StatusCode::BadRequest,
                                    _ => StatusCode::ServerInternalError,
                                };
                                core.reply(&job, status, vec![]).await;
                            }
                        }
                    }
                }
                debug!(worker, "register worker stopped");
            });
        }
        info!(workers = self.config.worker_count, "registrar started");
    }

    pub fn stop(&self) {
        self.queue.close();
    }

    /// Gatekeeper run on the dispatcher task: cheap checks and enqueue.
    pub async fn add_register(&self, job: RegisterJob) {
        if job.request.method != Method::Register {
            self.reply(&job, StatusCode::MethodNotAllowed, vec![]).await;
            return;
        }

        // An expiry below the floor is bounced immediately with the floor
        // advertised, before the request costs a worker.
        if let Some(requested) = requested_expiry(&job.request) {
            if requested > 0 && requested < self.config.min_expiry {
                let headers = vec![Header::MinExpires(rsip::headers::MinExpires::from(
                    self.config.min_expiry,
                ))];
                self.reply(&job, StatusCode::IntervalTooBrief, headers).await;
                return;
            }
        }

        if self.queue.try_push(job.clone()).is_err() {
            warn!(remote = %job.remote, "register queue full");
            self.reply(&job, StatusCode::TemporarilyUnavailable, vec![])
                .await;
        }
    }

    async fn process(&self, job: &RegisterJob) -> Result<()> {
        let request = job.request.as_ref();

        let to = request
            .to_header()
            .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;
        let to_typed = to
            .clone()
            .typed()
            .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;
        let to_host = to_typed.uri.host_with_port.host.to_string();
        let to_user = to_typed
            .uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_default();

        let Some(domain) = self.domains.canonicalise(&to_host) else {
            debug!(host = %to_host, remote = %job.remote, "register for unserviced domain");
            self.reply(job, StatusCode::Forbidden, vec![]).await;
            self.fail(job, RegisterFailureReason::DomainNotServiced);
            return Ok(());
        };

        let account = self
            .directory
            .account_by_username(&to_user, &domain.id)
            .await?;
        let Some(account) = account.filter(|account| !account.disabled) else {
            debug!(user = %to_user, domain = %domain.name, "register for unknown account");
            self.reply(job, StatusCode::Forbidden, vec![]).await;
            self.fail(job, RegisterFailureReason::Forbidden);
            return Ok(());
        };

        match self.authenticator.authenticate(
            request,
            &domain.name,
            &account.username,
            &account.ha1_digest,
        ) {
            AuthOutcome::Authenticated => {}
            AuthOutcome::Challenge(challenge) => {
                let headers = vec![Header::WwwAuthenticate(challenge.into())];
                self.reply(job, StatusCode::Unauthorized, headers).await;
                self.fail(job, RegisterFailureReason::Unauthenticated);
                return Ok(());
            }
            AuthOutcome::Forbidden => {
                self.reply(job, StatusCode::Forbidden, vec![]).await;
                self.fail(job, RegisterFailureReason::Unauthenticated);
                return Ok(());
            }
        }

        let contacts = contact_registrations(request);
        if contacts.is_empty() {
            // A contact-less REGISTER is a query for the current bindings.
            let bindings = self.bindings.get_for_account(&account.id).await?;
            let headers = binding_contact_headers(&bindings);
            self.reply(job, StatusCode::OK, headers).await;
            return Ok(());
        }

        let update = self.binding_update(job, &account, contacts);
        match self.bindings.update(update).await {
            Ok(bindings) => {
                info!(user = %account.username, domain = %domain.name,
                    bindings = bindings.len(), "register accepted");
                let headers = binding_contact_headers(&bindings);
                self.reply(job, StatusCode::OK, headers).await;
            }
            Err(err) => {
                // Storage trouble: accept the registration but advertise the
                // minimum expiry so the UA retries soon.
                warn!(error = %err, "binding update failed, forcing short expiry");
                let headers = short_expiry_contact_headers(request, self.config.min_expiry);
                self.reply(job, StatusCode::OK, headers).await;
            }
        }
        Ok(())
    }

    fn binding_update(
        &self,
        job: &RegisterJob,
        account: &Account,
        contacts: Vec<ContactRegistration>,
    ) -> BindingUpdate {
        let registrar_socket = self
            .transport
            .local_udp_addr(job.remote)
            .unwrap_or(job.local);
        BindingUpdate {
            account_id: account.id.clone(),
            contacts,
            header_expires: header_expires(&job.request),
            user_agent: user_agent_of(&job.request),
            remote_socket: job.remote.to_string(),
            proxy_socket: job.remote.to_string(),
            registrar_socket: registrar_socket.to_string(),
        }
    }

    fn fail(&self, job: &RegisterJob, reason: RegisterFailureReason) {
        self.failures.fire(&RegisterFailure {
            remote: job.remote,
            reason,
            uri_host_is_ip: request_uri_is_ip(&job.request),
        });
    }

    async fn reply(&self, job: &RegisterJob, status: StatusCode, headers: Vec<Header>) {
        let response = response_for(&job.request, status, headers);
        if let Err(err) = self
            .transport
            .send_response(response, job.remote, job.transport)
            .await
        {
            warn!(remote = %job.remote, error = %err, "failed to send register response");
        }
    }

    /// Expose the per-account lookup for diagnostics and tests.
    pub async fn bindings_for(&self, account_id: &str) -> Result<Vec<Binding>> {
        self.bindings.get_for_account(account_id).await
    }
}

/// The expiry the UA asked for: first contact parameter, else the Expires
/// header. `None` when the request names neither.
fn requested_expiry(request: &Request) -> Option<u32> {
    for contact in contact_headers(request) {
        if let Some(expires) = contact.expires().and_then(|value| value.seconds().ok()) {
            return Some(expires);
        }
    }
    header_expires(request)
}

fn header_expires(request: &Request) -> Option<u32> {
    request
        .expires_header()
        .and_then(|header| header.seconds().ok())
}

fn contact_headers(request: &Request) -> Vec<typed::Contact> {
    request
        .headers
        .iter()
        .filter_map(|header| match header {
            Header::Contact(contact) => contact.clone().typed().ok(),
            _ => None,
        })
        .collect()
}

fn contact_registrations(request: &Request) -> Vec<ContactRegistration> {
    contact_headers(request)
        .into_iter()
        .map(|contact| ContactRegistration {
            uri: contact.uri.to_string(),
            expires_param: contact.expires().and_then(|value| value.seconds().ok()),
        })
        .collect()
}

fn user_agent_of(request: &Request) -> String {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            Header::UserAgent(value) => Some(value.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// True when the request-URI host is a bare IP literal; scanners dial
/// addresses, humans dial names.
pub fn request_uri_is_ip(request: &Request) -> bool {
    match &request.uri.host_with_port.host {
        Host::IpAddr(_) => true,
        Host::Domain(domain) => domain.to_string().parse::<std::net::IpAddr>().is_ok(),
    }
}

/// Contact headers advertising each binding with its remaining TTL.
fn binding_contact_headers(bindings: &[Binding]) -> Vec<Header> {
    let now = chrono::Utc::now();
    bindings
        .iter()
        .map(|binding| {
            Header::Contact(rsip::headers::Contact::from(format!(
                "<{}>;expires={}",
                binding.contact_uri,
                binding.remaining_ttl(now)
            )))
        })
        .collect()
}

/// The request's own contacts echoed back with the minimum expiry forced.
fn short_expiry_contact_headers(request: &Request, min_expiry: u32) -> Vec<Header> {
    contact_headers(request)
        .into_iter()
        .map(|contact| {
            Header::Contact(rsip::headers::Contact::from(format!(
                "<{}>;expires={}",
                contact.uri, min_expiry
            )))
        })
        .collect()
}

// Used by the subscriber core, which shares the caller-resolution shape.
pub(crate) fn resolve_target<'a>(
    domains: &'a DomainRegistry,
    request: &Request,
) -> Option<(&'a Domain, String)> {
    let to = request.to_header().ok()?;
    let typed = to.clone().typed().ok()?;
    let host = typed.uri.host_with_port.host.to_string();
    let user = typed
        .uri
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .unwrap_or_default();
    domains.canonicalise(&host).map(|domain| (domain, user))
}
