//! Response and dialog-header construction helpers.
//!
//! Every core answers requests by mirroring the transaction headers of the
//! request (Via, From, To, Call-ID, CSeq) under a new status line, so the
//! builder lives next to the transport it is handed back to.

use rand::Rng;
use rsip::common::uri::param::Tag;
use rsip::headers::ToTypedHeader;
use rsip::message::headers_ext::HeadersExt;
use rsip::{Header, Headers, Param, Request, Response, StatusCode, Version};

/// Value advertised in the `Server` header of every locally-built response.
pub const SERVER_NAME: &str = "signalrtc";

/// Build a bodyless response for a request, mirroring its transaction headers.
pub fn response_for(request: &Request, status: StatusCode, extra_headers: Vec<Header>) -> Response {
    response_with_body(request, status, extra_headers, None)
}

/// Build a response for a request, mirroring its transaction headers.
///
/// A To tag is added for final responses when the request carried none;
/// provisional responses keep the To header untouched. A body's
/// Content-Type belongs in `extra_headers`.
pub fn response_with_body(
    request: &Request,
    status: StatusCode,
    extra_headers: Vec<Header>,
    body: Option<Vec<u8>>,
) -> Response {
    let mut headers = Headers::default();

    for header in request.headers.iter() {
        match header {
            Header::Via(via) => headers.push(Header::Via(via.clone())),
            Header::From(from) => headers.push(Header::From(from.clone())),
            Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
            Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
            _ => {}
        }
    }

    let is_final = status != StatusCode::Trying && status != StatusCode::Ringing;
    if let Ok(to) = request.to_header() {
        let needs_tag = is_final && !matches!(to.tag(), Ok(Some(_)));
        match (needs_tag, to.clone().typed()) {
            (true, Ok(mut typed)) => {
                typed.params.push(Param::Tag(new_tag()));
                headers.push(Header::To(typed.into()));
            }
            _ => headers.push(Header::To(to.clone())),
        }
    }

    headers.push(Header::Server(rsip::headers::Server::from(
        SERVER_NAME.to_string(),
    )));

    for header in extra_headers {
        headers.push(header);
    }

    let body = body.unwrap_or_default();
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(
        body.len() as u32,
    )));

    Response {
        status_code: status,
        version: Version::V2,
        headers,
        body,
    }
}

/// Fresh dialog tag.
pub fn new_tag() -> Tag {
    Tag::default()
}

/// Fresh RFC 3261 branch value.
pub fn new_branch() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("z9hG4bK{:016x}", suffix)
}

/// Transaction key used for retransmit detection: Call-ID, CSeq and the
/// top Via branch of a message.
pub fn transaction_key(headers: &Headers, is_request: bool) -> String {
    let mut call_id = String::new();
    let mut cseq = String::new();
    let mut branch = String::new();

    for header in headers.iter() {
        match header {
            Header::CallId(value) => call_id = value.to_string(),
            Header::CSeq(value) => cseq = value.to_string(),
            Header::Via(value) => {
                if branch.is_empty() {
                    if let Ok(typed) = value.clone().typed() {
                        for param in &typed.params {
                            if let Param::Branch(value) = param {
                                branch = value.to_string();
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    format!(
        "{}|{}|{}|{}",
        if is_request { "req" } else { "resp" },
        call_id,
        cseq,
        branch
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn register_request() -> Request {
        let raw = "REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK74bf9\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:user@example.com>;tag=456248\r\n\
            To: <sip:user@example.com>\r\n\
            Call-ID: 843817637684230@998sdasdh09\r\n\
            CSeq: 1826 REGISTER\r\n\
            Contact: <sip:user@1.2.3.4:5060>\r\n\
            Expires: 3600\r\n\
            Content-Length: 0\r\n\r\n";
        match rsip::SipMessage::try_from(raw).unwrap() {
            rsip::SipMessage::Request(request) => request,
            _ => unreachable!(),
        }
    }

    #[test]
    fn mirrors_transaction_headers() {
        let request = register_request();
        let response = response_for(&request, StatusCode::OK, vec![]);
        let text = response.to_string();

        assert!(text.starts_with("SIP/2.0 200"));
        assert!(text.contains("branch=z9hG4bK74bf9"));
        assert!(text.contains("843817637684230@998sdasdh09"));
        assert!(text.contains("1826 REGISTER"));
        assert!(text.contains("Server: signalrtc"));
    }

    #[test]
    fn final_response_gains_to_tag() {
        let request = register_request();
        let response = response_for(&request, StatusCode::OK, vec![]);
        let to = response.to_header().unwrap();
        assert!(matches!(to.tag(), Ok(Some(_))));
    }

    #[test]
    fn branches_are_unique() {
        let a = new_branch();
        let b = new_branch();
        assert_ne!(a, b);
        assert!(a.starts_with("z9hG4bK"));
    }

    #[test]
    fn transaction_key_stable_across_retransmits() {
        let request = register_request();
        let key_a = transaction_key(&request.headers, true);
        let key_b = transaction_key(&request.headers, true);
        assert_eq!(key_a, key_b);
        assert!(key_a.contains("z9hG4bK74bf9"));
    }
}
