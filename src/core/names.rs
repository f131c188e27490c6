//! Token validation and on-disk naming for bundles and items.
//!
//! - Slugs: 1..=64 Unicode letters, decimal digits and `-`.
//! - Versions: same alphabet plus `.`.
//! - Bundle directories: `sanitize(bundle_id) + "_" + slug`.
//! - Item files: `escape(slug) + "_" + escape(version) + ".json"`.

use crate::core::error::{Result, StoreError};
use regex::Regex;
use std::sync::LazyLock;

pub const MAX_TOKEN_CHARS: usize = 64;
pub const ITEM_FILE_EXT: &str = ".json";

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{Nd}-]+$").expect("static slug regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{Nd}.-]+$").expect("static version regex"));

fn check_token(token: &str, re: &Regex) -> std::result::Result<(), String> {
    if token.is_empty() {
        return Err("must not be empty".to_string());
    }
    if token.chars().count() > MAX_TOKEN_CHARS {
        return Err(format!("longer than {} characters", MAX_TOKEN_CHARS));
    }
    if !re.is_match(token) {
        return Err("allowed characters are letters, digits and '-'".to_string());
    }
    Ok(())
}

pub fn validate_slug(slug: &str) -> Result<()> {
    check_token(slug, &SLUG_RE).map_err(|msg| StoreError::InvalidSlug(slug.to_string(), msg))
}

pub fn validate_version(version: &str) -> Result<()> {
    check_token(version, &VERSION_RE).map_err(|msg| {
        StoreError::InvalidVersion(version.to_string(), msg.replace("'-'", "'-', '.'"))
    })
}

/// Keeps `[A-Za-z0-9_-]`; an id with nothing left becomes `x`.
pub fn sanitize_id(id: &str) -> String {
    let out: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if out.is_empty() { "x".to_string() } else { out }
}

pub fn bundle_dir_name(bundle_id: &str, slug: &str) -> Result<String> {
    validate_slug(slug)?;
    Ok(format!("{}_{}", sanitize_id(bundle_id), slug))
}

/// Splits a bundle directory name on its first `_` into (sanitized id, slug).
pub fn parse_bundle_dir_name(dir: &str) -> Result<(String, String)> {
    let Some((id, slug)) = dir.split_once('_') else {
        return Err(StoreError::InvalidDir(
            dir.to_string(),
            "missing '_' separator".to_string(),
        ));
    };
    if id.is_empty() {
        return Err(StoreError::InvalidDir(
            dir.to_string(),
            "empty bundle id".to_string(),
        ));
    }
    validate_slug(slug).map_err(|e| StoreError::InvalidDir(dir.to_string(), e.to_string()))?;
    Ok((id.to_string(), slug.to_string()))
}

pub fn item_file_name(slug: &str, version: &str) -> Result<String> {
    validate_slug(slug)?;
    validate_version(version)?;
    Ok(format!(
        "{}_{}{}",
        escape_component(slug),
        escape_component(version),
        ITEM_FILE_EXT
    ))
}

/// Inverse of [`item_file_name`]: splits on the last `_` before the extension.
pub fn parse_item_file_name(name: &str) -> Result<(String, String)> {
    let invalid = |msg: &str| StoreError::InvalidFilename(name.to_string(), msg.to_string());
    let stem = name
        .strip_suffix(ITEM_FILE_EXT)
        .ok_or_else(|| invalid("missing .json extension"))?;
    let (raw_slug, raw_version) = stem
        .rsplit_once('_')
        .ok_or_else(|| invalid("missing '_' separator"))?;
    let slug = unescape_component(raw_slug).ok_or_else(|| invalid("bad escape in slug"))?;
    let version =
        unescape_component(raw_version).ok_or_else(|| invalid("bad escape in version"))?;
    validate_slug(&slug).map_err(|e| invalid(&e.to_string()))?;
    validate_version(&version).map_err(|e| invalid(&e.to_string()))?;
    // One (slug, version) has exactly one file name; `t%31` or `h%c3%a9` would
    // otherwise alias `t1` and `h%C3%A9`.
    if escape_component(&slug) != raw_slug || escape_component(&version) != raw_version {
        return Err(invalid("not in canonical escaped form"));
    }
    Ok((slug, version))
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        // '_' is the field separator, so it is always escaped.
        if is_unreserved(b) && b != b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape_component(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
