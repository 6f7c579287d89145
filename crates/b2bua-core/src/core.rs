//! The B2BUA engine: INVITE queue, caller resolution, dialplan dispatch
//! and UAC origination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rsip::common::uri::param::Tag;
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Method, Request, Response, StatusCode, StatusCodeKind, Uri, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use signalrtc_registrar_core::{
    request_uri_is_ip, AuthOutcome, DigestAuthenticator, WorkQueue,
};
use signalrtc_sip_transport::{
    new_branch, response_for, response_with_body, TransportKind, TransportManager,
};
use signalrtc_users_core::{Account, DirectoryStore, DomainRegistry};

use crate::call::DialogLeg;
use crate::call_manager::CallManager;
use crate::cdr::CallDirection;
use crate::dialplan::{CallDescriptor, DialplanEvaluator};
use crate::error::{B2buaError, Result};
use crate::events::{AcceptCallFailure, AcceptCallFailureHooks, AcceptCallFailureReason};

/// B2BUA tuning knobs.
#[derive(Debug, Clone)]
pub struct B2buaConfig {
    /// INVITE queue capacity. Deliberately small: calls are expensive and
    /// a 480 beats a stale queue.
    pub max_invite_queue: usize,
    pub worker_count: usize,
    /// How long a dial-out may ring before the caller gets a 408.
    pub dial_timeout_secs: u64,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            max_invite_queue: 5,
            worker_count: 2,
            dial_timeout_secs: 60,
        }
    }
}

/// One INVITE waiting for a worker.
#[derive(Debug, Clone)]
pub struct InviteJob {
    pub request: Arc<Request>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: TransportKind,
}

/// The B2BUA service.
pub struct B2buaCore {
    queue: Arc<WorkQueue<InviteJob>>,
    transport: Arc<TransportManager>,
    directory: Arc<dyn DirectoryStore>,
    domains: Arc<DomainRegistry>,
    dialplan: Arc<DialplanEvaluator>,
    authenticator: Arc<DigestAuthenticator>,
    call_manager: Arc<CallManager>,
    failures: AcceptCallFailureHooks,
    /// UAS transactions still ringing, by Call-ID; CANCEL fires the token.
    ringing: DashMap<String, CancellationToken>,
    config: B2buaConfig,
    cancel: CancellationToken,
}

impl B2buaCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: B2buaConfig,
        transport: Arc<TransportManager>,
        directory: Arc<dyn DirectoryStore>,
        domains: Arc<DomainRegistry>,
        dialplan: Arc<DialplanEvaluator>,
        authenticator: Arc<DigestAuthenticator>,
        call_manager: Arc<CallManager>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(WorkQueue::new(config.max_invite_queue)),
            transport,
            directory,
            domains,
            dialplan,
            authenticator,
            call_manager,
            failures: AcceptCallFailureHooks::default(),
            ringing: DashMap::new(),
            config,
            cancel,
        })
    }

    pub fn on_accept_call_failure(
        &self,
        hook: Arc<dyn Fn(&AcceptCallFailure) + Send + Sync>,
    ) {
        self.failures.subscribe(hook);
    }

    pub fn call_manager(&self) -> &Arc<CallManager> {
        &self.call_manager
    }

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
                                error!(worker, error = %err, "invite processing failed");
                                core.reply(&job, StatusCode::ServerInternalError, vec![]).await;
                            }
                            if let Ok(call_id) = job.request.call_id_header() {
                                core.ringing.remove(&call_id.to_string());
                            }
                        }
                    }
                }
                debug!(worker, "b2bua worker stopped");
            });
        }
        info!(workers = self.config.worker_count, "b2bua core started");
    }

    pub fn stop(&self) {
        self.queue.close();
    }

    /// Gatekeeper: 405 / 480 checks, then 100 Trying and enqueue.
    pub async fn add_invite(&self, job: InviteJob) {
        if job.request.method != Method::Invite {
            self.reply(&job, StatusCode::MethodNotAllowed, vec![]).await;
            return;
        }

        if self.queue.is_full() {
            warn!(remote = %job.remote, "invite queue full");
            self.reply(&job, StatusCode::TemporarilyUnavailable, vec![])
                .await;
            return;
        }

        // Trying goes out and the CANCEL token is registered before the
        // job becomes visible to a worker.
        let call_id = job.request.call_id_header().ok().map(|id| id.to_string());
        if let Some(call_id) = &call_id {
            self.ringing.insert(call_id.clone(), CancellationToken::new());
        }
        self.reply(&job, StatusCode::Trying, vec![]).await;

        if self.queue.try_push(job.clone()).is_err() {
            warn!(remote = %job.remote, "invite queue full");
            if let Some(call_id) = &call_id {
                self.ringing.remove(call_id);
            }
            self.reply(&job, StatusCode::TemporarilyUnavailable, vec![])
                .await;
        }
    }

    /// CANCEL for a still-ringing UAS transaction.
    pub async fn cancel_invite(&self, request: &Request, remote: SocketAddr, kind: TransportKind) {
        let Ok(call_id) = request.call_id_header().map(|header| header.to_string()) else {
            return;
        };
        let response = response_for(request, StatusCode::OK, vec![]);
        if let Err(err) = self.transport.send_response(response, remote, kind).await {
            warn!(%remote, error = %err, "failed to answer CANCEL");
        }
        if let Some(entry) = self.ringing.get(&call_id) {
            entry.value().cancel();
            info!(%call_id, "invite cancelled by caller");
        } else {
            debug!(%call_id, "cancel for unknown invite");
        }
    }

    async fn process(&self, job: &InviteJob) -> Result<()> {
        let request = job.request.as_ref();

        let from = request
            .from_header()
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?
            .clone()
            .typed()
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?;
        let from_host = from.uri.host_with_port.host.to_string();
        let from_user = from
            .uri
            .auth
            .as_ref()
            .map(|auth| auth.user.clone())
            .unwrap_or_default();

        // Hosted callers must have an account and pass digest auth;
        // callers from foreign hosts are anonymous external parties.
        let caller_account: Option<Account> = match self.domains.canonicalise(&from_host) {
            Some(domain) => {
                let account = self
                    .directory
                    .account_by_username(&from_user, &domain.id)
                    .await?;
                let Some(account) = account.filter(|account| !account.disabled) else {
                    debug!(user = %from_user, domain = %domain.name, "caller has no account");
                    self.reply(job, StatusCode::Forbidden, vec![]).await;
                    self.fail(job, AcceptCallFailureReason::NoSipAccount);
                    return Ok(());
                };
                match self.authenticator.authenticate(
                    request,
                    &domain.name,
                    &account.username,
                    &account.ha1_digest,
                ) {
                    AuthOutcome::Authenticated => Some(account),
                    AuthOutcome::Challenge(challenge) => {
                        let headers = vec![Header::WwwAuthenticate(challenge.into())];
                        self.reply(job, StatusCode::Unauthorized, headers).await;
                        return Ok(());
                    }
                    AuthOutcome::Forbidden => {
                        self.reply(job, StatusCode::Forbidden, vec![]).await;
                        self.fail(job, AcceptCallFailureReason::NoSipAccount);
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        let to_user = dialled_user(request);
        let from_account = caller_account
            .as_ref()
            .map(|account| account.username.as_str())
            .unwrap_or("");

        let descriptor = self
            .dialplan
            .lookup(&to_user, from_account, &from_host)
            .await?;
        let Some(descriptor) = descriptor else {
            info!(user = %to_user, "dialplan returned no destination");
            self.reply(job, StatusCode::NotFound, vec![]).await;
            self.fail(job, AcceptCallFailureReason::NotFound);
            return Ok(());
        };

        self.dial(job, &from, descriptor).await
    }

    /// Originate the UAC leg and run the response loop until the call is
    /// bridged, failed or cancelled.
    async fn dial(
        &self,
        job: &InviteJob,
        caller_from: &typed::From,
        descriptor: CallDescriptor,
    ) -> Result<()> {
        let request = job.request.as_ref();
        let uas_call_id = request
            .call_id_header()
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?
            .to_string();

        let destination = resolve_destination(&descriptor.uri).await?;
        let local_socket = self
            .transport
            .local_udp_addr(destination)
            .unwrap_or(job.local);

        let uas_cdr = self
            .call_manager
            .cdrs()
            .create(
                CallDirection::Uas,
                &request.uri.to_string(),
                &caller_from.to_string(),
                &uas_call_id,
                &job.local.to_string(),
                &job.remote.to_string(),
                None,
            )
            .await?;

        let uac_call_id = Uuid::new_v4().to_string();
        let local_tag = Tag::default();
        let invite = build_uac_invite(
            request,
            caller_from,
            &descriptor,
            &uac_call_id,
            &local_tag,
            local_socket,
        )?;

        let uac_cdr = self
            .call_manager
            .cdrs()
            .create(
                CallDirection::Uac,
                &descriptor.uri,
                &invite_from_field(caller_from, &local_tag),
                &uac_call_id,
                &local_socket.to_string(),
                &destination.to_string(),
                None,
            )
            .await?;

        let mut responses = self.call_manager.register_uac(&uac_call_id);
        let ring_cancel = self
            .ringing
            .get(&uas_call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        debug!(destination = %descriptor.uri, "dialing uac leg");
        self.transport
            .send_request(invite.clone(), destination, TransportKind::Udp)
            .await?;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.dial_timeout_secs);
        let outcome = loop {
            tokio::select! {
                _ = ring_cancel.cancelled() => break DialOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break DialOutcome::Timeout,
                response = responses.recv() => {
                    let Some(response) = response else { break DialOutcome::Timeout };
                    match response.status_code.kind() {
                        StatusCodeKind::Provisional => {
                            if response.status_code == StatusCode::Ringing {
                                self.call_manager.cdrs().progress(&uas_cdr, 180, "Ringing").await?;
                                self.call_manager.cdrs().progress(&uac_cdr, 180, "Ringing").await?;
                                self.reply(job, StatusCode::Ringing, vec![]).await;
                            }
                        }
                        StatusCodeKind::Successful => break DialOutcome::Answered(response),
                        _ => break DialOutcome::Failed(response),
                    }
                }
            }
        };
        self.call_manager.unregister_uac(&uac_call_id);

        match outcome {
            DialOutcome::Answered(response) => {
                // One tag serves both the 200 we send and the stored leg,
                // so the caller's in-dialog requests match the bridge.
                let uas_local_tag = Tag::default().to_string();
                self.ack_uac(&invite, &response, destination).await;
                self.answer_uas(job, request, &response, &uas_local_tag)
                    .await?;
                self.establish_bridge(
                    job,
                    request,
                    &response,
                    caller_from,
                    &descriptor,
                    &uas_cdr,
                    &uac_cdr,
                    &uac_call_id,
                    &local_tag,
                    &uas_local_tag,
                    destination,
                )
                .await?;
                self.call_manager
                    .cdrs()
                    .answered(&uas_cdr, 200, "OK")
                    .await?;
                self.call_manager
                    .cdrs()
                    .answered(&uac_cdr, 200, "OK")
                    .await?;
                info!(destination = %descriptor.uri, "call bridged");
            }
            DialOutcome::Failed(response) => {
                let status = response.status_code.clone();
                info!(status = %status, "uac leg failed, propagating upstream");
                self.reply(job, status.clone(), vec![]).await;
                let reason = status.to_string();
                self.call_manager.cdrs().hungup(&uac_cdr, &reason).await?;
                self.call_manager.cdrs().hungup(&uas_cdr, &reason).await?;
            }
            DialOutcome::Cancelled => {
                self.send_cancel(&invite, destination).await;
                self.reply(job, StatusCode::RequestTerminated, vec![]).await;
                self.call_manager.cdrs().hungup(&uac_cdr, "cancelled").await?;
                self.call_manager.cdrs().hungup(&uas_cdr, "cancelled").await?;
            }
            DialOutcome::Timeout => {
                warn!(destination = %descriptor.uri, "no final response from destination");
                self.send_cancel(&invite, destination).await;
                self.reply(job, StatusCode::RequestTimeout, vec![]).await;
                self.call_manager.cdrs().hungup(&uac_cdr, "timeout").await?;
                self.call_manager.cdrs().hungup(&uas_cdr, "timeout").await?;
            }
        }
        Ok(())
    }

    /// Answer the caller with the destination's SDP, under the given To
    /// tag.
    async fn answer_uas(
        &self,
        job: &InviteJob,
        request: &Request,
        uac_response: &Response,
        uas_local_tag: &str,
    ) -> Result<()> {
        let mut headers = Vec::new();
        let contact_socket = self.transport.local_udp_addr(job.remote).unwrap_or(job.local);
        headers.push(Header::Contact(rsip::headers::Contact::from(format!(
            "<sip:{}@{}>",
            dialled_user(request),
            contact_socket
        ))));
        for header in uac_response.headers.iter() {
            if let Header::ContentType(content_type) = header {
                headers.push(Header::ContentType(content_type.clone()));
            }
        }

        let mut response = response_with_body(
            request,
            StatusCode::OK,
            headers,
            Some(uac_response.body.clone()),
        );
        set_to_tag(&mut response, request, uas_local_tag);
        self.transport
            .send_response(response, job.remote, job.transport)
            .await?;
        Ok(())
    }

    /// Build both dialog legs and hand them to the call manager.
    #[allow(clippy::too_many_arguments)]
    async fn establish_bridge(
        &self,
        job: &InviteJob,
        request: &Request,
        uac_response: &Response,
        caller_from: &typed::From,
        descriptor: &CallDescriptor,
        uas_cdr: &str,
        uac_cdr: &str,
        uac_call_id: &str,
        uac_local_tag: &Tag,
        uas_local_tag: &str,
        destination: SocketAddr,
    ) -> Result<()> {
        let bridge_id = CallManager::new_bridge_id();
        let uas_call_id = request
            .call_id_header()
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?
            .to_string();

        let caller_tag = caller_from
            .params
            .iter()
            .find_map(|param| match param {
                rsip::Param::Tag(tag) => Some(tag.to_string()),
                _ => None,
            })
            .unwrap_or_default();
        let caller_target = request
            .contact_header()
            .ok()
            .and_then(|header| header.clone().typed().ok())
            .map(|contact| contact.uri.to_string())
            .unwrap_or_else(|| format!("sip:{}", job.remote));

        let to_field = request
            .to_header()
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?
            .to_string();

        let uas_leg = DialogLeg {
            id: DialogLeg::new_id(),
            cdr_id: uas_cdr.to_string(),
            call_id: uas_call_id,
            local_tag: uas_local_tag.to_string(),
            remote_tag: caller_tag,
            cseq: 100,
            bridge_id: bridge_id.clone(),
            remote_target: caller_target,
            local_user_field: format!("{};tag={}", to_field, uas_local_tag),
            remote_user_field: caller_from.to_string(),
            route_set: None,
            direction: CallDirection::Uas,
            remote_socket: job.remote,
            transport: job.transport,
        };

        let destination_tag = uac_response
            .to_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten())
            .map(|tag| tag.to_string())
            .unwrap_or_default();
        let destination_target = uac_response
            .contact_header()
            .ok()
            .and_then(|header| header.clone().typed().ok())
            .map(|contact| contact.uri.to_string())
            .unwrap_or_else(|| descriptor.uri.clone());
        let destination_to_field = uac_response
            .to_header()
            .map(|header| header.to_string())
            .unwrap_or_else(|_| format!("<{}>", descriptor.uri));

        let uac_leg = DialogLeg {
            id: DialogLeg::new_id(),
            cdr_id: uac_cdr.to_string(),
            call_id: uac_call_id.to_string(),
            local_tag: uac_local_tag.to_string(),
            remote_tag: destination_tag,
            cseq: 1,
            bridge_id: bridge_id.clone(),
            remote_target: destination_target,
            local_user_field: invite_from_field(caller_from, uac_local_tag),
            remote_user_field: destination_to_field,
            route_set: None,
            direction: CallDirection::Uac,
            remote_socket: destination,
            transport: TransportKind::Udp,
        };

        self.call_manager.bridge(uas_leg, uac_leg).await?;
        Ok(())
    }

    /// ACK the destination's 200.
    async fn ack_uac(&self, invite: &Request, response: &Response, destination: SocketAddr) {
        let Ok(ack) = build_uac_ack(invite, response) else {
            warn!("could not build ACK for uac leg");
            return;
        };
        if let Err(err) = self
            .transport
            .send_request(ack, destination, TransportKind::Udp)
            .await
        {
            warn!(error = %err, "failed to send ACK");
        }
    }

    /// CANCEL a ringing UAC dial-out.
    async fn send_cancel(&self, invite: &Request, destination: SocketAddr) {
        let Ok(cancel) = build_uac_cancel(invite) else {
            return;
        };
        if let Err(err) = self
            .transport
            .send_request(cancel, destination, TransportKind::Udp)
            .await
        {
            warn!(error = %err, "failed to send CANCEL");
        }
    }

    fn fail(&self, job: &InviteJob, reason: AcceptCallFailureReason) {
        self.failures.fire(&AcceptCallFailure {
            remote: job.remote,
            reason,
            uri_host_is_ip: request_uri_is_ip(&job.request),
        });
    }

    async fn reply(&self, job: &InviteJob, status: StatusCode, headers: Vec<Header>) {
        let response = response_for(&job.request, status, headers);
        if let Err(err) = self
            .transport
            .send_response(response, job.remote, job.transport)
            .await
        {
            warn!(remote = %job.remote, error = %err, "failed to send invite response");
        }
    }
}

enum DialOutcome {
    Answered(Response),
    Failed(Response),
    Cancelled,
    Timeout,
}

/// The user being dialled: request-URI user, falling back to the To user.
fn dialled_user(request: &Request) -> String {
    if let Some(auth) = &request.uri.auth {
        return auth.user.clone();
    }
    request
        .to_header()
        .ok()
        .and_then(|header| header.clone().typed().ok())
        .and_then(|to| to.uri.auth.map(|auth| auth.user))
        .unwrap_or_default()
}

/// Resolve a destination URI to a socket address (DNS for hostnames,
/// straight parse for IP literals). Default SIP port when none is given.
async fn resolve_destination(uri_text: &str) -> Result<SocketAddr> {
    let uri =
        Uri::try_from(uri_text).map_err(|err| B2buaError::Unresolvable(err.to_string()))?;
    let port = uri
        .host_with_port
        .port
        .map(|port| *port.value())
        .unwrap_or(5060);

    match &uri.host_with_port.host {
        rsip::host_with_port::Host::IpAddr(addr) => Ok(SocketAddr::new(*addr, port)),
        rsip::host_with_port::Host::Domain(domain) => {
            let name = domain.to_string();
            if let Ok(addr) = name.parse::<std::net::IpAddr>() {
                return Ok(SocketAddr::new(addr, port));
            }
            let resolved = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|err| B2buaError::Unresolvable(err.to_string()))?
                .next()
                .ok_or_else(|| B2buaError::Unresolvable(uri_text.to_string()));
            resolved
        }
    }
}

fn invite_from_field(caller_from: &typed::From, tag: &Tag) -> String {
    let user = caller_from
        .uri
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    format!("<sip:{}@{}>;tag={}", user, caller_from.uri.host_with_port, tag)
}

/// Build the outgoing INVITE for the destination leg, carrying the
/// caller's SDP body untouched.
fn build_uac_invite(
    original: &Request,
    caller_from: &typed::From,
    descriptor: &CallDescriptor,
    call_id: &str,
    local_tag: &Tag,
    local_socket: SocketAddr,
) -> Result<Request> {
    let uri = Uri::try_from(descriptor.uri.as_str())
        .map_err(|err| B2buaError::Unresolvable(err.to_string()))?;

    let mut invite = Request {
        method: Method::Invite,
        uri: uri.clone(),
        version: Version::V2,
        headers: rsip::Headers::default(),
        body: original.body.clone(),
    };

    invite
        .headers
        .unique_push(Header::Via(rsip::headers::Via::from(format!(
            "SIP/2.0/UDP {};branch={}",
            local_socket,
            new_branch()
        ))));
    invite
        .headers
        .unique_push(Header::MaxForwards(rsip::headers::MaxForwards::from(70u32)));
    invite
        .headers
        .unique_push(Header::From(rsip::headers::From::from(invite_from_field(
            caller_from,
            local_tag,
        ))));
    invite
        .headers
        .unique_push(Header::To(rsip::headers::To::from(format!("<{}>", uri))));
    invite
        .headers
        .unique_push(Header::CallId(rsip::headers::CallId::from(
            call_id.to_string(),
        )));
    invite.headers.unique_push(Header::CSeq(
        typed::CSeq {
            seq: 1,
            method: Method::Invite,
        }
        .into(),
    ));
    invite
        .headers
        .unique_push(Header::Contact(rsip::headers::Contact::from(format!(
            "<sip:{}@{}>",
            caller_from
                .uri
                .auth
                .as_ref()
                .map(|auth| auth.user.as_str())
                .unwrap_or("anonymous"),
            local_socket
        ))));
    for header in original.headers.iter() {
        if let Header::ContentType(content_type) = header {
            invite
                .headers
                .unique_push(Header::ContentType(content_type.clone()));
        }
    }
    invite.headers.unique_push(Header::ContentLength(
        rsip::headers::ContentLength::from(invite.body.len() as u32),
    ));
    Ok(invite)
}

/// ACK for a 2xx on the UAC leg: same From/Call-ID, the 200's To.
fn build_uac_ack(invite: &Request, response: &Response) -> Result<Request> {
    let mut ack = Request {
        method: Method::Ack,
        uri: invite.uri.clone(),
        version: Version::V2,
        headers: rsip::Headers::default(),
        body: Vec::new(),
    };

    for header in invite.headers.iter() {
        match header {
            Header::From(from) => ack.headers.unique_push(Header::From(from.clone())),
            Header::CallId(call_id) => ack.headers.unique_push(Header::CallId(call_id.clone())),
            Header::MaxForwards(max_forwards) => {
                ack.headers.unique_push(Header::MaxForwards(max_forwards.clone()))
            }
            _ => {}
        }
    }
    if let Ok(to) = response.to_header() {
        ack.headers.unique_push(Header::To(to.clone()));
    }
    ack.headers
        .unique_push(Header::Via(rsip::headers::Via::from(format!(
            "SIP/2.0/UDP 0.0.0.0:0;branch={}",
            new_branch()
        ))));
    let seq = invite
        .cseq_header()
        .map_err(|err| B2buaError::BadRequest(err.to_string()))?
        .typed()
        .map_err(|err| B2buaError::BadRequest(err.to_string()))?
        .seq;
    ack.headers.unique_push(Header::CSeq(
        typed::CSeq {
            seq,
            method: Method::Ack,
        }
        .into(),
    ));
    ack.headers.unique_push(Header::ContentLength(
        rsip::headers::ContentLength::from(0u32),
    ));
    Ok(ack)
}

/// CANCEL for a pending INVITE: identical identity headers and CSeq seq.
fn build_uac_cancel(invite: &Request) -> Result<Request> {
    let mut cancel = Request {
        method: Method::Cancel,
        uri: invite.uri.clone(),
        version: Version::V2,
        headers: rsip::Headers::default(),
        body: Vec::new(),
    };
    for header in invite.headers.iter() {
        match header {
            Header::Via(via) => cancel.headers.unique_push(Header::Via(via.clone())),
            Header::From(from) => cancel.headers.unique_push(Header::From(from.clone())),
            Header::To(to) => cancel.headers.unique_push(Header::To(to.clone())),
            Header::CallId(call_id) => {
                cancel.headers.unique_push(Header::CallId(call_id.clone()))
            }
            Header::MaxForwards(max_forwards) => cancel
                .headers
                .unique_push(Header::MaxForwards(max_forwards.clone())),
            _ => {}
        }
    }
    let seq = invite
        .cseq_header()
        .map_err(|err| B2buaError::BadRequest(err.to_string()))?
        .typed()
        .map_err(|err| B2buaError::BadRequest(err.to_string()))?
        .seq;
    cancel.headers.unique_push(Header::CSeq(
        typed::CSeq {
            seq,
            method: Method::Cancel,
        }
        .into(),
    ));
    cancel.headers.unique_push(Header::ContentLength(
        rsip::headers::ContentLength::from(0u32),
    ));
    Ok(cancel)
}

/// Overwrite the response's To with the request's To plus our tag.
fn set_to_tag(response: &mut Response, request: &Request, tag: &str) {
    let Ok(to_value) = request.to_header().map(|to| to.to_string()) else {
        return;
    };
    for header in response.headers.iter_mut() {
        if let Header::To(to) = header {
            *to = rsip::headers::To::from(format!("{};tag={}", to_value, tag));
        }
    }
}
