//! Bridged dialog legs.
//!
//! Each bridged call is two legs sharing a `bridge_id`. A leg stores the
//! dialog identifiers needed to route and originate in-dialog requests;
//! rows are destroyed when either leg terminates.

use std::net::SocketAddr;

use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{Header, Method, Request, Version};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use signalrtc_sip_transport::{new_branch, TransportKind};

use crate::cdr::CallDirection;
use crate::error::{B2buaError, Result};

/// Identifies a dialog from the perspective of requests we receive on it.
pub type LegKey = (String, String, String); // (call_id, local_tag, remote_tag)

/// One leg of a bridged call.
#[derive(Debug, Clone)]
pub struct DialogLeg {
    pub id: String,
    pub cdr_id: String,
    pub call_id: String,
    /// Our tag on this dialog (To tag of requests the peer sends us).
    pub local_tag: String,
    /// The peer's tag.
    pub remote_tag: String,
    /// Our CSeq for requests we originate on this leg.
    pub cseq: u32,
    pub bridge_id: String,
    /// URI in-dialog requests are sent to (the peer's Contact).
    pub remote_target: String,
    /// Full name-addr we use as From on requests we originate, tag included.
    pub local_user_field: String,
    /// Full name-addr of the peer, tag included.
    pub remote_user_field: String,
    pub route_set: Option<String>,
    pub direction: CallDirection,
    pub remote_socket: SocketAddr,
    pub transport: TransportKind,
}

impl DialogLeg {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn key(&self) -> LegKey {
        (
            self.call_id.clone(),
            self.local_tag.clone(),
            self.remote_tag.clone(),
        )
    }

    /// Build an in-dialog request we originate on this leg, bumping our
    /// CSeq. The caller sends it to `remote_socket`.
    pub fn build_request(&mut self, method: Method, body: Vec<u8>) -> Result<Request> {
        let uri = rsip::Uri::try_from(self.remote_target.as_str())
            .map_err(|err| B2buaError::BadRequest(err.to_string()))?;
        self.cseq += 1;

        let mut request = Request {
            method,
            uri,
            version: Version::V2,
            headers: rsip::Headers::default(),
            body,
        };
        request.headers.unique_push(Header::Via(rsip::headers::Via::from(format!(
            "SIP/2.0/{} 0.0.0.0:0;branch={}",
            self.transport.to_string().to_uppercase(),
            new_branch()
        ))));
        request
            .headers
            .unique_push(Header::MaxForwards(rsip::headers::MaxForwards::from(70u32)));
        request.headers.unique_push(Header::From(rsip::headers::From::from(
            self.local_user_field.clone(),
        )));
        request
            .headers
            .unique_push(Header::To(rsip::headers::To::from(
                self.remote_user_field.clone(),
            )));
        request
            .headers
            .unique_push(Header::CallId(rsip::headers::CallId::from(
                self.call_id.clone(),
            )));
        request.headers.unique_push(Header::CSeq(
            rsip::typed::CSeq {
                seq: self.cseq,
                method,
            }
            .into(),
        ));
        if let Some(route_set) = &self.route_set {
            if !route_set.is_empty() {
                request
                    .headers
                    .unique_push(Header::Route(rsip::headers::Route::from(route_set.clone())));
            }
        }
        request.headers.unique_push(Header::ContentLength(
            rsip::headers::ContentLength::from(request.body.len() as u32),
        ));
        Ok(request)
    }

    /// Patch the Via host of a built request with the socket we are
    /// actually sending from.
    pub fn set_via_sent_by(request: &mut Request, local: SocketAddr) {
        if let Ok(via) = request.via_header_mut() {
            if let Ok(mut typed) = via.clone().typed() {
                typed.uri.host_with_port = local.into();
                *via = typed.into();
            }
        }
    }
}

/// Persistence for dialog legs.
#[derive(Clone)]
pub struct SipCallStore {
    pool: SqlitePool,
}

impl SipCallStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sip_calls (
                id                TEXT PRIMARY KEY,
                cdr_id            TEXT NOT NULL,
                call_id           TEXT NOT NULL,
                local_tag         TEXT NOT NULL,
                remote_tag        TEXT NOT NULL,
                cseq              INTEGER NOT NULL,
                bridge_id         TEXT NOT NULL,
                remote_target     TEXT NOT NULL,
                local_user_field  TEXT NOT NULL,
                remote_user_field TEXT NOT NULL,
                route_set         TEXT,
                direction         TEXT NOT NULL,
                remote_socket     TEXT NOT NULL,
                transport         TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn insert(&self, leg: &DialogLeg) -> Result<()> {
        sqlx::query(
            "INSERT INTO sip_calls
             (id, cdr_id, call_id, local_tag, remote_tag, cseq, bridge_id, remote_target,
              local_user_field, remote_user_field, route_set, direction, remote_socket, transport)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&leg.id)
        .bind(&leg.cdr_id)
        .bind(&leg.call_id)
        .bind(&leg.local_tag)
        .bind(&leg.remote_tag)
        .bind(leg.cseq as i64)
        .bind(&leg.bridge_id)
        .bind(&leg.remote_target)
        .bind(&leg.local_user_field)
        .bind(&leg.remote_user_field)
        .bind(&leg.route_set)
        .bind(leg.direction.as_str())
        .bind(leg.remote_socket.to_string())
        .bind(leg.transport.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_cseq(&self, leg_id: &str, cseq: u32) -> Result<()> {
        sqlx::query("UPDATE sip_calls SET cseq = ? WHERE id = ?")
            .bind(cseq as i64)
            .bind(leg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every leg of a bridge; returns how many were removed.
    pub async fn remove_bridge(&self, bridge_id: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM sip_calls WHERE bridge_id = ?")
            .bind(bridge_id)
            .execute(&self.pool)
            .await?;
        Ok(removed.rows_affected())
    }

    pub async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sip_calls")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}
