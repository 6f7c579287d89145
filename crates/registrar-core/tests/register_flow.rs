//! End-to-end REGISTER flows over loopback UDP: challenge, digest retry,
//! binding queries and the 423 floor.

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rsip::headers::ToTypedHeader;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use signalrtc_registrar_core::{
    BindingStore, DigestAuthenticator, RegisterJob, RegistrarConfig, RegistrarCore,
};
use signalrtc_sip_transport::{TransportConfig, TransportKind, TransportManager};
use signalrtc_users_core::{
    Account, CreateAccountRequest, DirectoryStore, DomainRegistry, SqliteDirectoryStore,
};

const REALM: &str = "192.168.0.50";

struct Fixture {
    registrar: Arc<RegistrarCore>,
    transport: Arc<TransportManager>,
    account: Account,
    ua: UdpSocket,
    ua_addr: SocketAddr,
}

async fn fixture() -> Fixture {
    // Single connection: pooled sqlite::memory: connections do not share
    // a database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let directory = SqliteDirectoryStore::new(pool.clone()).await.unwrap();
    let domain = directory.create_domain(REALM, &[]).await.unwrap();
    let account = directory
        .create_account(
            CreateAccountRequest {
                username: "user".into(),
                domain_id: domain.id.clone(),
                password: "password".into(),
            },
            &domain.name,
        )
        .await
        .unwrap();
    let domains = DomainRegistry::load(&directory).await.unwrap();

    let config = RegistrarConfig {
        worker_count: 1,
        ..RegistrarConfig::default()
    };
    let bindings = Arc::new(BindingStore::new(pool, config.clone()).await.unwrap());
    let transport = TransportManager::bind(TransportConfig {
        sip_port: 0,
        sip_tls_port: 0,
        ..TransportConfig::default()
    })
    .await
    .unwrap();

    let registrar = RegistrarCore::new(
        config,
        transport.clone(),
        Arc::new(directory),
        domains,
        bindings,
        Arc::new(DigestAuthenticator::new()),
        CancellationToken::new(),
    );
    registrar.start();

    let ua = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ua_addr = ua.local_addr().unwrap();

    Fixture {
        registrar,
        transport,
        account,
        ua,
        ua_addr,
    }
}

impl Fixture {
    fn job(&self, raw: &str) -> RegisterJob {
        let request = match rsip::SipMessage::try_from(raw).unwrap() {
            rsip::SipMessage::Request(request) => request,
            _ => unreachable!(),
        };
        RegisterJob {
            request: Arc::new(request),
            local: self.transport.local_udp_addr(self.ua_addr).unwrap(),
            remote: self.ua_addr,
            transport: TransportKind::Udp,
        }
    }

    async fn recv_response(&self) -> rsip::Response {
        let mut buf = vec![0u8; 65_535];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), self.ua.recv_from(&mut buf))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        match rsip::SipMessage::try_from(&buf[..len]).unwrap() {
            rsip::SipMessage::Response(response) => response,
            _ => panic!("expected response"),
        }
    }
}

fn register_raw(cseq: u32, expires: u32, authorization: Option<&str>) -> String {
    let auth_line = authorization
        .map(|value| format!("Authorization: {}\r\n", value))
        .unwrap_or_default();
    format!(
        "REGISTER sip:{realm} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKreg{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:user@{realm}>;tag=reg-tag\r\n\
         To: <sip:user@{realm}>\r\n\
         Call-ID: reg-call-1@1.2.3.4\r\n\
         CSeq: {cseq} REGISTER\r\n\
         {auth_line}Contact: <sip:user@1.2.3.4:5060>\r\n\
         Expires: {expires}\r\n\
         User-Agent: test-ua/1.0\r\n\
         Content-Length: 0\r\n\r\n",
        realm = REALM,
        cseq = cseq,
        expires = expires,
        auth_line = auth_line,
    )
}

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

fn digest_authorization(nonce: &str) -> String {
    let uri = format!("sip:{}", REALM);
    let ha1 = md5_hex(format!("user:{}:password", REALM).as_bytes());
    let ha2 = md5_hex(format!("REGISTER:{}", uri).as_bytes());
    let response = md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes());
    format!(
        "Digest username=\"user\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        REALM, nonce, uri, response
    )
}

fn nonce_of(response: &rsip::Response) -> String {
    response
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::WwwAuthenticate(value) => value.clone().typed().ok(),
            _ => None,
        })
        .expect("challenge expected")
        .nonce
}

#[tokio::test]
async fn fresh_register_challenge_then_bind() {
    let fixture = fixture().await;

    // First attempt carries no credentials and is challenged.
    fixture
        .registrar
        .add_register(fixture.job(&register_raw(1, 3600, None)))
        .await;
    let challenge = fixture.recv_response().await;
    assert_eq!(challenge.status_code, rsip::StatusCode::Unauthorized);
    let nonce = nonce_of(&challenge);

    // Retry with the digest response.
    let authorization = digest_authorization(&nonce);
    fixture
        .registrar
        .add_register(fixture.job(&register_raw(2, 3600, Some(&authorization))))
        .await;
    let ok = fixture.recv_response().await;
    assert_eq!(ok.status_code, rsip::StatusCode::OK);
    let text = ok.to_string();
    assert!(text.contains("sip:user@1.2.3.4:5060"));
    assert!(text.contains("expires=3600") || text.contains("expires=3599"));
    assert!(text.contains("Server: signalrtc"));

    // The binding is queryable and its expiry window is ~3600s.
    let bindings = fixture
        .registrar
        .bindings_for(&fixture.account.id)
        .await
        .unwrap();
    assert_eq!(bindings.len(), 1);
    let ttl = bindings[0].remaining_ttl(chrono::Utc::now());
    assert!((3598..=3600).contains(&ttl), "ttl was {}", ttl);
}

#[tokio::test]
async fn two_challenges_use_distinct_nonces() {
    let fixture = fixture().await;

    fixture
        .registrar
        .add_register(fixture.job(&register_raw(1, 3600, None)))
        .await;
    let first = nonce_of(&fixture.recv_response().await);

    fixture
        .registrar
        .add_register(fixture.job(&register_raw(2, 3600, None)))
        .await;
    let second = nonce_of(&fixture.recv_response().await);

    assert_ne!(first, second);
}

#[tokio::test]
async fn below_minimum_expiry_rejected_without_binding() {
    let fixture = fixture().await;

    fixture
        .registrar
        .add_register(fixture.job(&register_raw(1, 30, None)))
        .await;
    let response = fixture.recv_response().await;
    assert_eq!(response.status_code, rsip::StatusCode::IntervalTooBrief);
    assert!(response.to_string().contains("Min-Expires: 60"));

    let bindings = fixture
        .registrar
        .bindings_for(&fixture.account.id)
        .await
        .unwrap();
    assert!(bindings.is_empty());
}

#[tokio::test]
async fn unknown_domain_forbidden() {
    let fixture = fixture().await;

    let raw = register_raw(1, 3600, None).replace(REALM, "evil.example");
    fixture.registrar.add_register(fixture.job(&raw)).await;
    let response = fixture.recv_response().await;
    assert_eq!(response.status_code, rsip::StatusCode::Forbidden);
}

#[tokio::test]
async fn non_register_method_rejected() {
    let fixture = fixture().await;

    let raw = register_raw(1, 3600, None)
        .replace("REGISTER sip:", "MESSAGE sip:")
        .replace("1 REGISTER", "1 MESSAGE");
    fixture.registrar.add_register(fixture.job(&raw)).await;
    let response = fixture.recv_response().await;
    assert_eq!(response.status_code, rsip::StatusCode::MethodNotAllowed);
}
