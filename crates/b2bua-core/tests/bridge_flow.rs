//! End-to-end call bridging over loopback UDP: an external caller INVITEs
//! a dialplan-routed user, the destination answers, both CDR legs share a
//! bridge, and BYE tears both legs down.

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use signalrtc_b2bua_core::{
    B2buaConfig, B2buaCore, CallManager, CdrStore, DialplanEvaluator, DialplanStore, InviteJob,
    SipCallStore, DEFAULT_DIALPLAN,
};
use signalrtc_registrar_core::DigestAuthenticator;
use signalrtc_sip_transport::{TransportConfig, TransportKind, TransportManager};
use signalrtc_users_core::{DirectoryStore, DomainRegistry, SqliteDirectoryStore};

struct Fixture {
    b2bua: Arc<B2buaCore>,
    call_manager: Arc<CallManager>,
    transport: Arc<TransportManager>,
    caller: UdpSocket,
    caller_addr: SocketAddr,
    destination: UdpSocket,
    destination_addr: SocketAddr,
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
    directory.create_domain("192.168.0.50", &[]).await.unwrap();
    let domains = DomainRegistry::load(&directory).await.unwrap();

    let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let destination_addr = destination.local_addr().unwrap();

    // Route user 100 straight at the test's destination socket.
    let dialplans = DialplanStore::new(pool.clone()).await.unwrap();
    dialplans
        .update(
            DEFAULT_DIALPLAN,
            &format!(
                r#"fn lookup(to_user, from_user, from_host) {{
                    switch to_user {{
                        "100" => fwd("100@{}"),
                        _ => ()
                    }}
                }}"#,
                destination_addr
            ),
        )
        .await
        .unwrap();
    let evaluator = DialplanEvaluator::new(dialplans);

    let transport = TransportManager::bind(TransportConfig {
        sip_port: 0,
        sip_tls_port: 0,
        ..TransportConfig::default()
    })
    .await
    .unwrap();

    let cdrs = CdrStore::new(pool.clone()).await.unwrap();
    let sip_calls = SipCallStore::new(pool).await.unwrap();
    let call_manager = CallManager::new(transport.clone(), cdrs, sip_calls);

    let b2bua = B2buaCore::new(
        B2buaConfig {
            worker_count: 1,
            dial_timeout_secs: 5,
            ..B2buaConfig::default()
        },
        transport.clone(),
        Arc::new(directory),
        domains,
        evaluator,
        Arc::new(DigestAuthenticator::new()),
        call_manager.clone(),
        CancellationToken::new(),
    );
    b2bua.start();

    let caller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let caller_addr = caller.local_addr().unwrap();

    Fixture {
        b2bua,
        call_manager,
        transport,
        caller,
        caller_addr,
        destination,
        destination_addr,
    }
}

fn caller_invite(caller_addr: SocketAddr) -> String {
    format!(
        "INVITE sip:100@192.168.0.50 SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller};branch=z9hG4bKcall1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@external.net>;tag=alice-tag\r\n\
         To: <sip:100@192.168.0.50>\r\n\
         Call-ID: bridge-call-1@{caller}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@{caller}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: 18\r\n\r\nv=0\r\no=offer sdp\r\n",
        caller = caller_addr,
    )
}

async fn recv_message(socket: &UdpSocket) -> (rsip::SipMessage, SocketAddr) {
    let mut buf = vec![0u8; 65_535];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for message")
        .unwrap();
    (rsip::SipMessage::try_from(&buf[..len]).unwrap(), from)
}

async fn recv_response(socket: &UdpSocket) -> rsip::Response {
    match recv_message(socket).await.0 {
        rsip::SipMessage::Response(response) => response,
        other => panic!("expected response, got {}", other),
    }
}

async fn recv_request(socket: &UdpSocket) -> rsip::Request {
    match recv_message(socket).await.0 {
        rsip::SipMessage::Request(request) => request,
        other => panic!("expected request, got {}", other),
    }
}

fn answer_for(invite: &rsip::Request) -> rsip::Response {
    use rsip::message::headers_ext::HeadersExt;
    let raw = format!(
        "SIP/2.0 200 OK\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to};tag=dest-tag\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq}\r\n\
         Contact: <{contact}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: 19\r\n\r\nv=0\r\no=answer sdp\r\n",
        via = invite.via_header().unwrap(),
        from = invite.from_header().unwrap(),
        to = invite.to_header().unwrap(),
        call_id = invite.call_id_header().unwrap(),
        cseq = invite.cseq_header().unwrap(),
        contact = invite.uri,
    );
    match rsip::SipMessage::try_from(raw.as_str()).unwrap() {
        rsip::SipMessage::Response(response) => response,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn external_caller_is_bridged_to_dialplan_destination() {
    let fixture = fixture().await;

    let invite = match rsip::SipMessage::try_from(caller_invite(fixture.caller_addr).as_str())
        .unwrap()
    {
        rsip::SipMessage::Request(request) => request,
        _ => unreachable!(),
    };
    fixture
        .b2bua
        .add_invite(InviteJob {
            request: Arc::new(invite),
            local: fixture.transport.local_udp_addr(fixture.caller_addr).unwrap(),
            remote: fixture.caller_addr,
            transport: TransportKind::Udp,
        })
        .await;

    // Caller hears 100 Trying immediately.
    let trying = recv_response(&fixture.caller).await;
    assert_eq!(trying.status_code, rsip::StatusCode::Trying);

    // The destination sees a fresh INVITE carrying the caller's SDP.
    let uac_invite = recv_request(&fixture.destination).await;
    assert_eq!(uac_invite.method, rsip::Method::Invite);
    let uac_text = uac_invite.to_string();
    assert!(uac_text.contains("o=offer sdp"));
    assert!(!uac_text.contains("bridge-call-1"), "uac leg must be a new dialog");

    // Destination answers; the engine routes the response by Call-ID.
    fixture
        .call_manager
        .handle_response(Arc::new(answer_for(&uac_invite)))
        .await
        .unwrap();

    // The destination is ACKed and the caller gets the 200 with the
    // destination's SDP.
    let ack = recv_request(&fixture.destination).await;
    assert_eq!(ack.method, rsip::Method::Ack);
    let ok = recv_response(&fixture.caller).await;
    assert_eq!(ok.status_code, rsip::StatusCode::OK);
    assert!(ok.to_string().contains("o=answer sdp"));

    // Both CDR legs exist and share one bridge id.
    assert_eq!(fixture.call_manager.active_bridges(), 1);

    // Caller hangs up: the destination leg gets a BYE.
    use rsip::message::headers_ext::HeadersExt;
    let our_tag = ok
        .to_header()
        .unwrap()
        .tag()
        .unwrap()
        .expect("200 must carry a to tag");
    let bye = format!(
        "BYE sip:100@192.168.0.50 SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller};branch=z9hG4bKbye1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@external.net>;tag=alice-tag\r\n\
         To: <sip:100@192.168.0.50>;tag={tag}\r\n\
         Call-ID: bridge-call-1@{caller}\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n",
        caller = fixture.caller_addr,
        tag = our_tag,
    );
    let bye = match rsip::SipMessage::try_from(bye.as_str()).unwrap() {
        rsip::SipMessage::Request(request) => request,
        _ => unreachable!(),
    };
    fixture
        .call_manager
        .process_in_dialog(Arc::new(bye), fixture.caller_addr, TransportKind::Udp)
        .await
        .unwrap();

    let bye_ok = recv_response(&fixture.caller).await;
    assert_eq!(bye_ok.status_code, rsip::StatusCode::OK);
    let peer_bye = recv_request(&fixture.destination).await;
    assert_eq!(peer_bye.method, rsip::Method::Bye);
    assert_eq!(fixture.call_manager.active_bridges(), 0);
}

#[tokio::test]
async fn unrouted_user_gets_404_and_failure_event() {
    let fixture = fixture().await;

    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let fired = fired.clone();
        fixture.b2bua.on_accept_call_failure(Arc::new(move |failure| {
            assert_eq!(
                failure.reason,
                signalrtc_b2bua_core::AcceptCallFailureReason::NotFound
            );
            fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
    }

    let raw = caller_invite(fixture.caller_addr).replace("sip:100@", "sip:999@");
    let invite = match rsip::SipMessage::try_from(raw.as_str()).unwrap() {
        rsip::SipMessage::Request(request) => request,
        _ => unreachable!(),
    };
    fixture
        .b2bua
        .add_invite(InviteJob {
            request: Arc::new(invite),
            local: fixture.transport.local_udp_addr(fixture.caller_addr).unwrap(),
            remote: fixture.caller_addr,
            transport: TransportKind::Udp,
        })
        .await;

    let trying = recv_response(&fixture.caller).await;
    assert_eq!(trying.status_code, rsip::StatusCode::Trying);
    let not_found = recv_response(&fixture.caller).await;
    assert_eq!(not_found.status_code, rsip::StatusCode::NotFound);
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_dialout_status_propagates_upstream() {
    let fixture = fixture().await;

    let invite = match rsip::SipMessage::try_from(caller_invite(fixture.caller_addr).as_str())
        .unwrap()
    {
        rsip::SipMessage::Request(request) => request,
        _ => unreachable!(),
    };
    fixture
        .b2bua
        .add_invite(InviteJob {
            request: Arc::new(invite),
            local: fixture.transport.local_udp_addr(fixture.caller_addr).unwrap(),
            remote: fixture.caller_addr,
            transport: TransportKind::Udp,
        })
        .await;

    let _trying = recv_response(&fixture.caller).await;
    let uac_invite = recv_request(&fixture.destination).await;

    // Destination is busy.
    use rsip::message::headers_ext::HeadersExt;
    let busy = format!(
        "SIP/2.0 486 Busy Here\r\n\
         Via: {via}\r\n\
         From: {from}\r\n\
         To: {to};tag=busy-tag\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq}\r\n\
         Content-Length: 0\r\n\r\n",
        via = uac_invite.via_header().unwrap(),
        from = uac_invite.from_header().unwrap(),
        to = uac_invite.to_header().unwrap(),
        call_id = uac_invite.call_id_header().unwrap(),
        cseq = uac_invite.cseq_header().unwrap(),
    );
    let busy = match rsip::SipMessage::try_from(busy.as_str()).unwrap() {
        rsip::SipMessage::Response(response) => response,
        _ => unreachable!(),
    };
    fixture.call_manager.handle_response(Arc::new(busy)).await.unwrap();

    let upstream = recv_response(&fixture.caller).await;
    assert_eq!(upstream.status_code, rsip::StatusCode::BusyHere);
    assert_eq!(fixture.call_manager.active_bridges(), 0);
}
