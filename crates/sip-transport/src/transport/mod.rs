//! Listener implementations per transport

pub mod tcp;
pub mod tls;
pub mod udp;

use bytes::BytesMut;

// Maximum size of a single SIP message on any transport
pub(crate) const MAX_MESSAGE_SIZE: usize = 65_535;
// Initial receive buffer size for stream transports
pub(crate) const INITIAL_BUFFER_SIZE: usize = 8_192;

/// Extract one complete SIP message from a stream buffer, if present.
///
/// Stream transports carry back-to-back messages; a message is complete when
/// the header block has arrived and `Content-Length` more bytes follow it.
pub(crate) fn extract_message(buffer: &mut BytesMut) -> Option<Vec<u8>> {
    let head_end = find_header_end(buffer)?;
    let content_length = parse_content_length(&buffer[..head_end]).unwrap_or(0);
    let total = head_end + 4 + content_length;
    if buffer.len() < total {
        return None;
    }
    Some(buffer.split_to(total).to_vec())
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(head: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_framed_messages() {
        let first: &[u8] = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nabcd";
        let second_partial: &[u8] = b"OPTIONS sip:b SIP/2.0\r\nContent-Length: 0\r\n";

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(first);
        buffer.extend_from_slice(second_partial);

        let msg = extract_message(&mut buffer).unwrap();
        assert_eq!(msg, first.to_vec());
        // Second message is incomplete until the blank line arrives.
        assert!(extract_message(&mut buffer).is_none());
        buffer.extend_from_slice(b"\r\n");
        assert!(extract_message(&mut buffer).is_some());
        assert!(buffer.is_empty());
    }
}
