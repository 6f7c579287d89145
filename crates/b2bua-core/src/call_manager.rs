//! Active-bridge tracking and in-dialog request routing.
//!
//! The manager owns every established dialog leg. In-dialog requests are
//! located by `(Call-ID, local tag, remote tag)` and forwarded to the
//! paired leg; BYE on one leg tears the other down and finalises both
//! CDRs. Responses to our own outgoing requests are routed back to the
//! task that sent them.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{Header, Method, Request, Response, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use signalrtc_sip_transport::{response_for, TransportKind, TransportManager};

use crate::call::{DialogLeg, LegKey, SipCallStore};
use crate::cdr::CdrStore;
use crate::error::{B2buaError, Result};

/// A response channel for a transaction we originated.
pub type ResponseSender = mpsc::UnboundedSender<Response>;

/// A forwarded in-dialog request waiting for the peer's final response.
struct PendingForward {
    original: Arc<Request>,
    originator: SocketAddr,
    transport: TransportKind,
}

pub struct CallManager {
    transport: Arc<TransportManager>,
    cdrs: CdrStore,
    store: SipCallStore,
    legs: DashMap<LegKey, Arc<Mutex<DialogLeg>>>,
    bridges: DashMap<String, Vec<LegKey>>,
    /// Outgoing transactions (UAC INVITEs) waiting for responses, by the
    /// leg's Call-ID.
    pending_uac: DashMap<String, ResponseSender>,
    /// Forwarded in-dialog requests, keyed by `(call_id, cseq)` of the
    /// request we sent to the peer.
    pending_forwards: DashMap<(String, u32), PendingForward>,
}

impl CallManager {
    pub fn new(transport: Arc<TransportManager>, cdrs: CdrStore, store: SipCallStore) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cdrs,
            store,
            legs: DashMap::new(),
            bridges: DashMap::new(),
            pending_uac: DashMap::new(),
            pending_forwards: DashMap::new(),
        })
    }

    pub fn cdrs(&self) -> &CdrStore {
        &self.cdrs
    }

    /// Route a transaction we originate: responses for `call_id` flow into
    /// the returned receiver until `unregister_uac` is called.
    pub fn register_uac(&self, call_id: &str) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_uac.insert(call_id.to_string(), tx);
        rx
    }

    pub fn unregister_uac(&self, call_id: &str) {
        self.pending_uac.remove(call_id);
    }

    /// Persist two answered legs as one bridge.
    pub async fn bridge(&self, leg_a: DialogLeg, leg_b: DialogLeg) -> Result<String> {
        let bridge_id = leg_a.bridge_id.clone();
        debug_assert_eq!(leg_a.bridge_id, leg_b.bridge_id);

        self.cdrs.set_bridge(&leg_a.cdr_id, &bridge_id).await?;
        self.cdrs.set_bridge(&leg_b.cdr_id, &bridge_id).await?;
        self.store.insert(&leg_a).await?;
        self.store.insert(&leg_b).await?;

        let keys = vec![leg_a.key(), leg_b.key()];
        self.legs
            .insert(leg_a.key(), Arc::new(Mutex::new(leg_a)));
        self.legs
            .insert(leg_b.key(), Arc::new(Mutex::new(leg_b)));
        self.bridges.insert(bridge_id.clone(), keys);

        info!(bridge = %bridge_id, "dialog legs bridged");
        Ok(bridge_id)
    }

    pub fn new_bridge_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn active_bridges(&self) -> usize {
        self.bridges.len()
    }

    /// Handle a request that belongs to an established dialog.
    pub async fn process_in_dialog(
        &self,
        request: Arc<Request>,
        remote: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let Some(key) = dialog_key_of(&request) else {
            // To-tagged request without a full dialog id; nothing to match.
            self.reply(&request, remote, transport, StatusCode::CallTransactionDoesNotExist)
                .await;
            return Ok(());
        };

        let Some(leg) = self.legs.get(&key).map(|entry| entry.value().clone()) else {
            if request.method == Method::Ack {
                // ACKs to our final responses on dead transactions are fine.
                debug!(call_id = %key.0, "ack for unknown dialog absorbed");
                return Ok(());
            }
            debug!(call_id = %key.0, method = %request.method, "no dialog for in-dialog request");
            self.reply(&request, remote, transport, StatusCode::CallTransactionDoesNotExist)
                .await;
            return Ok(());
        };

        match request.method {
            Method::Ack => {
                debug!(call_id = %key.0, "in-dialog ack absorbed");
                Ok(())
            }
            Method::Bye => self.handle_bye(&request, remote, transport, leg).await,
            Method::Invite | Method::Info | Method::Update | Method::Message => {
                self.forward_to_peer(&request, remote, transport, leg).await
            }
            _ => {
                self.reply(&request, remote, transport, StatusCode::MethodNotAllowed)
                    .await;
                Ok(())
            }
        }
    }

    /// BYE: answer it, hang up the paired leg, finalise both CDRs, destroy
    /// the bridge.
    async fn handle_bye(
        &self,
        request: &Arc<Request>,
        remote: SocketAddr,
        transport: TransportKind,
        leg: Arc<Mutex<DialogLeg>>,
    ) -> Result<()> {
        self.reply(request, remote, transport, StatusCode::OK).await;

        let (bridge_id, this_key, this_cdr) = {
            let leg = leg.lock().await;
            (leg.bridge_id.clone(), leg.key(), leg.cdr_id.clone())
        };
        self.cdrs.hungup(&this_cdr, "BYE").await?;

        if let Some((_, keys)) = self.bridges.remove(&bridge_id) {
            for key in keys {
                let Some((_, peer)) = self.legs.remove(&key) else {
                    continue;
                };
                if key == this_key {
                    continue;
                }
                let mut peer = peer.lock().await;
                let bye = peer.build_request(Method::Bye, Vec::new())?;
                self.send_on_leg(&peer, bye).await;
                self.cdrs.hungup(&peer.cdr_id, "bridged leg hungup").await?;
            }
        }
        let removed = self.store.remove_bridge(&bridge_id).await?;
        info!(bridge = %bridge_id, legs = removed, "bridge terminated");
        Ok(())
    }

    /// Forward a re-INVITE (or other in-dialog method) to the peer leg,
    /// remembering the transaction so the final response can be relayed
    /// back.
    async fn forward_to_peer(
        &self,
        request: &Arc<Request>,
        remote: SocketAddr,
        transport: TransportKind,
        leg: Arc<Mutex<DialogLeg>>,
    ) -> Result<()> {
        let bridge_id = { leg.lock().await.bridge_id.clone() };
        let this_key = { leg.lock().await.key() };

        let peer = self
            .bridges
            .get(&bridge_id)
            .and_then(|keys| {
                keys.iter()
                    .find(|key| **key != this_key)
                    .and_then(|key| self.legs.get(key).map(|entry| entry.value().clone()))
            })
            .ok_or(B2buaError::DialogNotFound)?;

        let mut peer = peer.lock().await;
        let forwarded = peer.build_request(request.method, request.body.clone())?;
        let forwarded = copy_content_type(request, forwarded);
        self.pending_forwards.insert(
            (peer.call_id.clone(), peer.cseq),
            PendingForward {
                original: request.clone(),
                originator: remote,
                transport,
            },
        );
        self.store.update_cseq(&peer.id, peer.cseq).await?;
        debug!(method = %request.method, bridge = %peer.bridge_id, "in-dialog request forwarded");
        self.send_on_leg(&peer, forwarded).await;
        Ok(())
    }

    /// Route a received response: UAC dial-outs first, then forwarded
    /// in-dialog transactions; everything else is absorbed.
    pub async fn handle_response(&self, response: Arc<Response>) -> Result<()> {
        let Ok(call_id) = response.call_id_header().map(|header| header.to_string()) else {
            return Ok(());
        };

        if let Some(sender) = self
            .pending_uac
            .get(&call_id)
            .map(|entry| entry.value().clone())
        {
            let _ = sender.send(response.as_ref().clone());
            return Ok(());
        }

        let cseq_seq = response
            .cseq_header()
            .and_then(|header| header.typed())
            .map(|cseq| cseq.seq)
            .unwrap_or(0);
        if let Some((_, pending)) = self.pending_forwards.remove(&(call_id.clone(), cseq_seq)) {
            // Final responses are relayed upstream with the peer's body;
            // provisionals are put back to wait for the final.
            if matches!(
                response.status_code.kind(),
                rsip::StatusCodeKind::Provisional
            ) {
                self.pending_forwards
                    .insert((call_id, cseq_seq), pending);
                return Ok(());
            }
            let mut headers = Vec::new();
            if let Some(content_type) = content_type_of_response(&response) {
                headers.push(content_type);
            }
            let relayed = signalrtc_sip_transport::response_with_body(
                &pending.original,
                response.status_code.clone(),
                headers,
                Some(response.body.clone()),
            );
            if let Err(err) = self
                .transport
                .send_response(relayed, pending.originator, pending.transport)
                .await
            {
                warn!(error = %err, "failed to relay in-dialog response");
            }
            return Ok(());
        }

        debug!(call_id = %call_id, status = %response.status_code, "response absorbed");
        Ok(())
    }

    async fn send_on_leg(&self, leg: &DialogLeg, mut request: Request) {
        if let Some(local) = self.transport.local_udp_addr(leg.remote_socket) {
            DialogLeg::set_via_sent_by(&mut request, local);
        }
        if let Err(err) = self
            .transport
            .send_request(request, leg.remote_socket, leg.transport)
            .await
        {
            warn!(remote = %leg.remote_socket, error = %err, "failed to send in-dialog request");
        }
    }

    async fn reply(
        &self,
        request: &Request,
        remote: SocketAddr,
        transport: TransportKind,
        status: StatusCode,
    ) {
        let response = response_for(request, status, vec![]);
        if let Err(err) = self.transport.send_response(response, remote, transport).await {
            warn!(%remote, error = %err, "failed to send in-dialog reply");
        }
    }
}

/// Dialog key of an incoming request: `(call_id, to_tag, from_tag)` — the
/// To tag is ours, the From tag is the peer's.
pub fn dialog_key_of(request: &Request) -> Option<LegKey> {
    let call_id = request.call_id_header().ok()?.to_string();
    let to_tag = request
        .to_header()
        .ok()
        .and_then(|header| header.tag().ok().flatten())?
        .to_string();
    let from_tag = request
        .from_header()
        .ok()
        .and_then(|header| header.tag().ok().flatten())?
        .to_string();
    Some((call_id, to_tag, from_tag))
}

fn copy_content_type(original: &Request, mut forwarded: Request) -> Request {
    for header in original.headers.iter() {
        if let Header::ContentType(content_type) = header {
            forwarded
                .headers
                .unique_push(Header::ContentType(content_type.clone()));
        }
    }
    forwarded
}

fn content_type_of_response(response: &Response) -> Option<Header> {
    response.headers.iter().find_map(|header| match header {
        Header::ContentType(content_type) => Some(Header::ContentType(content_type.clone())),
        _ => None,
    })
}
