//! HTTP surface: the WebRTC signalling relay plus the small admin API for
//! accounts and the dialplan.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use signalrtc_b2bua_core::{DialplanEvaluator, DialplanStore, DEFAULT_DIALPLAN};
use signalrtc_users_core::{CreateAccountRequest, DirectoryStore, DomainRegistry};

use crate::store::{SignalStore, SignalType};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub signals: SignalStore,
    pub directory: Arc<dyn DirectoryStore>,
    pub domains: Arc<DomainRegistry>,
    pub dialplans: DialplanStore,
    pub evaluator: Arc<DialplanEvaluator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/webrtcsignal/sdp/:from/:to", put(put_sdp))
        .route("/api/webrtcsignal/ice/:from/:to", put(put_ice))
        .route("/api/webrtcsignal/:to/:from/:kind", get(get_next))
        .route("/api/dialplan", get(get_dialplan).put(update_dialplan))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/:id", delete(delete_account))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn internal_error<E: std::fmt::Display>(err: E) -> Response {
    warn!(error = %err, "http handler error");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

// ---- relay handlers ----

async fn put_sdp(
    State(state): State<ApiState>,
    Path((from, to)): Path<(String, String)>,
    body: String,
) -> Response {
    match state.signals.put_sdp(&from, &to, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(err),
    }
}

async fn put_ice(
    State(state): State<ApiState>,
    Path((from, to)): Path<(String, String)>,
    body: String,
) -> Response {
    match state.signals.put_ice(&from, &to, &body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_next(
    State(state): State<ApiState>,
    Path((to, from, kind)): Path<(String, String, String)>,
) -> Response {
    let kind = match SignalType::parse(&kind) {
        Ok(kind) => kind,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    match state.signals.get_next(&to, &from, kind).await {
        Ok(Some(body)) => (StatusCode::OK, body).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(err),
    }
}

// ---- admin handlers ----

#[derive(Debug, Serialize)]
struct DialplanView {
    name: String,
    script_source: String,
    last_update: DateTime<Utc>,
    /// Most recent compile failure, cleared on a clean compile.
    last_compile_error: Option<String>,
}

async fn get_dialplan(State(state): State<ApiState>) -> Response {
    match state.dialplans.get(DEFAULT_DIALPLAN).await {
        Ok(Some(record)) => Json(DialplanView {
            name: record.name,
            script_source: record.script_source,
            last_update: record.last_update,
            last_compile_error: state.evaluator.last_error(),
        })
        .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateDialplanRequest {
    script_source: String,
}

async fn update_dialplan(
    State(state): State<ApiState>,
    Json(request): Json<UpdateDialplanRequest>,
) -> Response {
    if let Err(err) = state
        .dialplans
        .update(DEFAULT_DIALPLAN, &request.script_source)
        .await
    {
        return internal_error(err);
    }
    // Compile eagerly so the admin sees errors now, not on the next call.
    if let Err(err) = state.evaluator.refresh_if_stale().await {
        return (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response();
    }
    match state.evaluator.last_error() {
        Some(error) => (StatusCode::UNPROCESSABLE_ENTITY, error).into_response(),
        None => StatusCode::OK.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateAccountBody {
    username: String,
    domain: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct AccountView {
    id: String,
    username: String,
    domain_id: String,
    disabled: bool,
}

async fn list_accounts(State(state): State<ApiState>) -> Response {
    let mut accounts = Vec::new();
    for domain in state.domains.domains() {
        match state.directory.list_accounts(&domain.id).await {
            Ok(list) => accounts.extend(list.into_iter().map(|account| AccountView {
                id: account.id,
                username: account.username,
                domain_id: account.domain_id,
                disabled: account.disabled,
            })),
            Err(err) => return internal_error(err),
        }
    }
    Json(accounts).into_response()
}

async fn create_account(
    State(state): State<ApiState>,
    Json(body): Json<CreateAccountBody>,
) -> Response {
    let Some(domain) = state.domains.canonicalise(&body.domain) else {
        return (StatusCode::BAD_REQUEST, "domain not serviced").into_response();
    };
    // The plaintext password stops here: the store hashes it into HA1.
    let request = CreateAccountRequest {
        username: body.username,
        domain_id: domain.id.clone(),
        password: body.password,
    };
    match state.directory.create_account(request, &domain.name).await {
        Ok(account) => (
            StatusCode::CREATED,
            Json(AccountView {
                id: account.id,
                username: account.username,
                domain_id: account.domain_id,
                disabled: account.disabled,
            }),
        )
            .into_response(),
        Err(signalrtc_users_core::Error::AccountExists { .. }) => {
            (StatusCode::CONFLICT, "account exists").into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn delete_account(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.directory.delete_account(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalrtc_b2bua_core::DialplanStore;
    use signalrtc_users_core::SqliteDirectoryStore;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let directory = SqliteDirectoryStore::new(pool.clone()).await.unwrap();
        directory.create_domain("example.com", &[]).await.unwrap();
        let domains = DomainRegistry::load(&directory).await.unwrap();
        let dialplans = DialplanStore::new(pool.clone()).await.unwrap();
        dialplans.seed_if_missing().await.unwrap();
        let evaluator = DialplanEvaluator::new(dialplans.clone());
        ApiState {
            signals: SignalStore::new(pool).await.unwrap(),
            directory: Arc::new(directory),
            domains,
            dialplans,
            evaluator,
        }
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: &str,
    ) -> (StatusCode, String) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", if body.starts_with('{') { "application/json" } else { "text/plain" })
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn relay_roundtrip_and_reoffer() {
        let app = router(test_state().await);
        let offer1 = r#"{"type":"offer","sdp":"one"}"#;
        let offer2 = r#"{"type":"offer","sdp":"two"}"#;
        let ice = r#"{"candidate":"candidate:1"}"#;

        assert_eq!(send(&app, "PUT", "/api/webrtcsignal/sdp/a/b", offer1).await.0, StatusCode::OK);
        assert_eq!(send(&app, "PUT", "/api/webrtcsignal/ice/a/b", ice).await.0, StatusCode::OK);
        assert_eq!(send(&app, "PUT", "/api/webrtcsignal/sdp/a/b", offer2).await.0, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/webrtcsignal/b/a/any", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, offer2);

        let (status, _) = send(&app, "GET", "/api/webrtcsignal/b/a/any", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn bad_signal_type_is_rejected() {
        let app = router(test_state().await);
        let (status, _) = send(&app, "GET", "/api/webrtcsignal/b/a/bogus", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn account_admin_flow() {
        let app = router(test_state().await);
        let (status, body) = send(
            &app,
            "POST",
            "/api/accounts",
            r#"{"username":"alice","domain":"example.com","password":"secret"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        // The response never leaks the password or digest.
        assert!(!body.contains("secret"));
        assert!(!body.contains("ha1"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/accounts",
            r#"{"username":"alice","domain":"example.com","password":"secret"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn dialplan_update_reports_compile_errors() {
        let app = router(test_state().await);
        let (status, _) = send(
            &app,
            "PUT",
            "/api/dialplan",
            r#"{"script_source":"fn lookup(a, b, c) { broken"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
