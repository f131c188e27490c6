//! Opaque page tokens: base64-URL encoded JSON.

use crate::core::error::{Result, StoreError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 256;

pub fn encode<T: Serialize>(cursor: &T) -> Result<String> {
    let bytes = serde_json::to_vec(cursor).map_err(|e| StoreError::codec("page token", e))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn decode<T: DeserializeOwned>(token: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim_end_matches('='))
        .map_err(|e| StoreError::InvalidRequest(format!("malformed page token: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::InvalidRequest(format!("malformed page token: {}", e)))
}

/// Out-of-range sizes fall back to the default.
pub fn clamp_page_size(size: usize) -> usize {
    if size == 0 || size > MAX_PAGE_SIZE {
        DEFAULT_PAGE_SIZE
    } else {
        size
    }
}

/// Empty strings count as "no token".
pub fn non_empty(token: Option<&str>) -> Option<&str> {
    token.filter(|t| !t.trim().is_empty())
}
