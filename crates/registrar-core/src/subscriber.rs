//! SUBSCRIBE processing and the dummy message-waiting NOTIFY.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rsip::common::uri::param::Tag;
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Method, Request, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use signalrtc_sip_transport::{new_branch, response_for, TransportKind, TransportManager};
use signalrtc_users_core::DirectoryStore;
use signalrtc_users_core::DomainRegistry;

use crate::auth::{AuthOutcome, DigestAuthenticator};
use crate::error::{RegistrarError, Result};
use crate::queue::WorkQueue;
use crate::registrar::resolve_target;
use crate::types::RegistrarConfig;

// Pause before the NOTIFY so the UA has processed the 200 first.
const NOTIFY_DELAY: Duration = Duration::from_secs(2);

/// One SUBSCRIBE waiting for a worker.
#[derive(Debug, Clone)]
pub struct SubscribeJob {
    pub request: Arc<Request>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: TransportKind,
}

/// The subscriber service. Same queue/worker shape as the registrar.
pub struct SubscriberCore {
    queue: Arc<WorkQueue<SubscribeJob>>,
    transport: Arc<TransportManager>,
    directory: Arc<dyn DirectoryStore>,
    domains: Arc<DomainRegistry>,
    authenticator: Arc<DigestAuthenticator>,
    config: RegistrarConfig,
    cancel: CancellationToken,
}

impl SubscriberCore {
    pub fn new(
        config: RegistrarConfig,
        transport: Arc<TransportManager>,
        directory: Arc<dyn DirectoryStore>,
        domains: Arc<DomainRegistry>,
        authenticator: Arc<DigestAuthenticator>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(WorkQueue::new(config.max_subscribe_queue)),
            transport,
            directory,
            domains,
            authenticator,
            config,
            cancel,
        })
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
                                error!(worker, error = %err, "subscribe processing failed");
                                let status = match err {
                                    RegistrarError::BadRequest(_) => StatusCode::BadRequest,
                                    _ => StatusCode::ServerInternalError,
                                };
                                core.reply(&job, status, vec![]).await;
                            }
                        }
                    }
                }
                debug!(worker, "subscribe worker stopped");
            });
        }
        info!(workers = self.config.worker_count, "subscriber core started");
    }

    pub fn stop(&self) {
        self.queue.close();
    }

    pub async fn add_subscribe(&self, job: SubscribeJob) {
        if job.request.method != Method::Subscribe {
            self.reply(&job, StatusCode::MethodNotAllowed, vec![]).await;
            return;
        }
        if self.queue.try_push(job.clone()).is_err() {
            warn!(remote = %job.remote, "subscribe queue full");
            self.reply(&job, StatusCode::TemporarilyUnavailable, vec![])
                .await;
        }
    }

    async fn process(&self, job: &SubscribeJob) -> Result<()> {
        let request = job.request.as_ref();

        let Some((domain, user)) = resolve_target(&self.domains, request) else {
            debug!(remote = %job.remote, "subscribe for unserviced domain");
            self.reply(job, StatusCode::Forbidden, vec![]).await;
            return Ok(());
        };

        let account = self.directory.account_by_username(&user, &domain.id).await?;
        let Some(account) = account.filter(|account| !account.disabled) else {
            self.reply(job, StatusCode::Forbidden, vec![]).await;
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
                return Ok(());
            }
            AuthOutcome::Forbidden => {
                self.reply(job, StatusCode::Forbidden, vec![]).await;
                return Ok(());
            }
        }

        let expires = request
            .expires_header()
            .and_then(|header| header.seconds().ok())
            .unwrap_or(3600);
        let headers = vec![Header::Expires(rsip::headers::Expires::from(expires))];
        self.reply(job, StatusCode::OK, headers).await;

        if event_package(request).eq_ignore_ascii_case("message-summary") && expires > 0 {
            self.schedule_mwi_notify(job, expires);
        }
        Ok(())
    }

    /// Queue the dummy `Messages-Waiting: no` NOTIFY toward the request's
    /// remote endpoint. Deliberately not the Contact URI: for cloud-hosted
    /// deployments the source socket is the only address sure to traverse
    /// the subscriber's NAT.
    fn schedule_mwi_notify(&self, job: &SubscribeJob, expires: u32) {
        let Ok(notify) = build_mwi_notify(job, expires) else {
            warn!(remote = %job.remote, "could not build NOTIFY for subscription");
            return;
        };
        let transport = self.transport.clone();
        let remote = job.remote;
        let kind = job.transport;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(NOTIFY_DELAY) => {
                    if let Err(err) = transport.send_request(notify, remote, kind).await {
                        warn!(%remote, error = %err, "failed to send NOTIFY");
                    } else {
                        debug!(%remote, "message-waiting NOTIFY sent");
                    }
                }
            }
        });
    }

    async fn reply(&self, job: &SubscribeJob, status: StatusCode, headers: Vec<Header>) {
        let response = response_for(&job.request, status, headers);
        if let Err(err) = self
            .transport
            .send_response(response, job.remote, job.transport)
            .await
        {
            warn!(remote = %job.remote, error = %err, "failed to send subscribe response");
        }
    }
}

/// The request's event package, empty when absent.
fn event_package(request: &Request) -> String {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            Header::Event(value) => Some(value.to_string()),
            Header::Other(name, value) if name.eq_ignore_ascii_case("event") => {
                Some(value.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Build the in-subscription NOTIFY: same Call-ID, the subscriber's From
/// becomes our To, and the request-URI targets the remote socket directly.
fn build_mwi_notify(job: &SubscribeJob, expires: u32) -> Result<Request> {
    let request = job.request.as_ref();

    let from = request
        .from_header()
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?
        .clone();
    let to = request
        .to_header()
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;
    let call_id = request
        .call_id_header()
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?
        .clone();

    let subscriber_user = from
        .clone()
        .typed()
        .ok()
        .and_then(|typed| typed.uri.auth.map(|auth| auth.user))
        .unwrap_or_default();
    let target_uri = Uri::try_from(format!("sip:{}@{}", subscriber_user, job.remote).as_str())
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;

    let mut notify = Request {
        method: Method::Notify,
        uri: target_uri,
        version: Version::V2,
        headers: rsip::Headers::default(),
        body: b"Messages-Waiting: no\r\n".to_vec(),
    };

    let via = format!(
        "SIP/2.0/{} {};branch={}",
        job.transport.to_string().to_uppercase(),
        job.local,
        new_branch()
    );
    notify
        .headers
        .unique_push(Header::Via(rsip::headers::Via::from(via)));
    notify
        .headers
        .unique_push(Header::MaxForwards(rsip::headers::MaxForwards::from(70u32)));

    // Dialog identity: our To (tagged) becomes the NOTIFY's From.
    let mut notifier = to
        .clone()
        .typed()
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;
    if !matches!(to.tag(), Ok(Some(_))) {
        notifier.params.push(rsip::Param::Tag(Tag::default()));
    }
    let notifier = typed::From {
        display_name: notifier.display_name,
        uri: notifier.uri,
        params: notifier.params,
    };
    notify
        .headers
        .unique_push(Header::From(notifier.into()));

    let subscriber = from
        .typed()
        .map_err(|err| RegistrarError::BadRequest(err.to_string()))?;
    let subscriber = typed::To {
        display_name: subscriber.display_name,
        uri: subscriber.uri,
        params: subscriber.params,
    };
    notify.headers.unique_push(Header::To(subscriber.into()));

    notify.headers.unique_push(Header::CallId(call_id));
    notify.headers.unique_push(Header::CSeq(
        typed::CSeq {
            seq: 1,
            method: Method::Notify,
        }
        .into(),
    ));
    notify.headers.unique_push(Header::Event(
        rsip::headers::Event::from("message-summary".to_string()),
    ));
    notify.headers.unique_push(Header::Other(
        "Subscription-State".into(),
        format!("active;expires={}", expires),
    ));
    notify.headers.unique_push(Header::ContentType(
        rsip::headers::ContentType::from("application/simple-message-summary".to_string()),
    ));
    notify.headers.unique_push(Header::ContentLength(
        rsip::headers::ContentLength::from(notify.body.len() as u32),
    ));

    Ok(notify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn subscribe_request() -> SubscribeJob {
        let raw = "SUBSCRIBE sip:user@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKsub1\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:user@example.com>;tag=sub-tag\r\n\
            To: <sip:user@example.com>\r\n\
            Call-ID: sub-call-1@1.2.3.4\r\n\
            CSeq: 2 SUBSCRIBE\r\n\
            Contact: <sip:user@10.99.0.2:5060>\r\n\
            Event: message-summary\r\n\
            Expires: 600\r\n\
            Content-Length: 0\r\n\r\n";
        let request = match rsip::SipMessage::try_from(raw).unwrap() {
            rsip::SipMessage::Request(request) => request,
            _ => unreachable!(),
        };
        SubscribeJob {
            request: Arc::new(request),
            local: "192.168.0.50:5060".parse().unwrap(),
            remote: "1.2.3.4:5060".parse().unwrap(),
            transport: TransportKind::Udp,
        }
    }

    #[test]
    fn event_package_extracted() {
        let job = subscribe_request();
        assert_eq!(event_package(&job.request), "message-summary");
    }

    #[test]
    fn notify_targets_remote_socket_not_contact() {
        let job = subscribe_request();
        let notify = build_mwi_notify(&job, 600).unwrap();
        let text = notify.to_string();

        // The Contact advertised 10.99.0.2; the NOTIFY must go to the
        // request's source socket instead.
        assert!(text.starts_with("NOTIFY sip:user@1.2.3.4:5060"));
        assert!(!text.contains("10.99.0.2"));
        assert!(text.contains("Messages-Waiting: no"));
        assert!(text.contains("Event: message-summary"));
        assert!(text.contains("Subscription-State: active;expires=600"));
        // Same dialog: Call-ID preserved, subscriber's tag on our To.
        assert!(text.contains("sub-call-1@1.2.3.4"));
        assert!(text.contains("tag=sub-tag"));
    }
}
