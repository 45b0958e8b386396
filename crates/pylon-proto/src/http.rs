//! Canned HTTP responses and routing-line extraction for the public ingress
//!
//! The broker never interprets public traffic as HTTP beyond pulling the
//! routing domain out of the first read; requests and replies are forwarded
//! byte for byte. These templates cover the paths where no agent ever sees
//! the request.

/// Served when the first read cannot be parsed far enough to find a domain.
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 12\r\n\r\nBad request\n";

/// Served when the agent connection died while an exchange was pending.
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 12\r\n\r\nAgent error\n";

/// Served when no reply arrived within the exchange timeout.
pub const GATEWAY_TIMEOUT: &[u8] =
    b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 14\r\n\r\nAgent timeout\n";

/// Fixed prefix of the not-found body. Its length is baked into the
/// Content-Length arithmetic below and is relied on by deployed clients.
const NOT_FOUND_PREFIX: &str = "Domain not found: ";

/// Served when the requested domain has no live agent behind it. The body
/// echoes the domain; Content-Length is the domain length plus the 18-byte
/// prefix.
pub fn not_found_response(domain: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}{}",
        domain.len() + NOT_FOUND_PREFIX.len(),
        NOT_FOUND_PREFIX,
        domain
    )
    .into_bytes()
}

/// Pull the routing domain out of a raw request.
///
/// The domain is the value of the first header line after the request line:
/// everything after the first `:`, trimmed. Returns `None` when the request
/// has no such line or the line has no colon.
pub fn extract_domain(request: &str) -> Option<&str> {
    let mut lines = request.lines();
    lines.next()?;
    let header = lines.next()?;
    let (_, value) = header.split_once(':')?;
    Some(value.trim())
}
