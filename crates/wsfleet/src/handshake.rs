//! WebSocket upgrade request validation (RFC 6455 section 4.2.1).

use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::header;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

const SUPPORTED_VERSION: &str = "13";
const KEY_NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("websocket upgrade requires GET, got {0}")]
    Method(String),
    #[error("Connection header must include the upgrade token")]
    ConnectionHeader,
    #[error("Upgrade header must be websocket")]
    UpgradeHeader,
    #[error("unsupported Sec-WebSocket-Version {0:?}")]
    Version(Option<String>),
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    #[error("invalid Sec-WebSocket-Key {0:?}")]
    InvalidKey(String),
    #[error("upgrade rejected: {0}")]
    Rejected(String),
}

/// True when the request asks to switch to the websocket protocol. Everything
/// else is plain HTTP.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    has_token(headers, header::UPGRADE, "websocket")
}

pub fn validate(method: &Method, headers: &HeaderMap) -> Result<(), HandshakeError> {
    if method != Method::GET {
        return Err(HandshakeError::Method(method.to_string()));
    }
    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(HandshakeError::ConnectionHeader);
    }
    if !wants_upgrade(headers) {
        return Err(HandshakeError::UpgradeHeader);
    }

    let version = header_str(headers, header::SEC_WEBSOCKET_VERSION);
    if version.map(str::trim) != Some(SUPPORTED_VERSION) {
        return Err(HandshakeError::Version(version.map(str::to_string)));
    }

    let key = header_str(headers, header::SEC_WEBSOCKET_KEY).ok_or(HandshakeError::MissingKey)?;
    validate_key(key)
}

fn validate_key(key: &str) -> Result<(), HandshakeError> {
    let key = key.trim();
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == KEY_NONCE_LEN => Ok(()),
        _ => Err(HandshakeError::InvalidKey(key.to_string())),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
