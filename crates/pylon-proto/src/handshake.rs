//! Agent handshake strings and codecs
//!
//! Everything here is text sent over the control connection while an agent
//! logs in. Agents in the field parse these strings verbatim, so they are
//! part of the wire contract, typos included.

/// Sent to an agent as soon as its connection is accepted.
pub const LOGIN_PROMPT: &str = "Please login";

/// Sent when credentials are malformed or do not match. Unknown identities
/// get the same bytes as wrong secrets.
pub const AUTH_FAILED: &str = "Error auth message";

/// Sent when the credential store cannot be reached.
pub const STORE_UNAVAILABLE: &str = "System error, please try again latter";

/// Sent once registration succeeded, followed by the domain listing.
pub const REGISTER_OK: &str = "ok";

/// Split a credential message into identity and secret.
///
/// The message must contain exactly one `:`; anything else is malformed.
/// Empty identity or secret is left for the credential lookup to reject.
pub fn parse_credentials(message: &str) -> Option<(&str, &str)> {
    let mut parts = message.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(identity), Some(secret), None) => Some((identity, secret)),
        _ => None,
    }
}

/// Render the registration summary sent after [`REGISTER_OK`]: one
/// `domain|target` entry per binding, newline-joined. Empty when the agent
/// has no mappings; the message is sent regardless.
pub fn format_domain_list(mappings: &[(String, String)]) -> String {
    mappings
        .iter()
        .map(|(domain, target)| format!("{}|{}", domain, target))
        .collect::<Vec<_>>()
        .join("\n")
}
