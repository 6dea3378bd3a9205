//! Cross-origin policy for the opening handshake.
//!
//! A request is allowed when any of these holds:
//! - it carries no `Origin` header (non-browser clients)
//! - the `Origin` host equals the request `Host` (case-insensitive)
//! - the `Origin` host matches one of the configured glob patterns
//! - verification is disabled
//!
//! Patterns containing `://` are matched against `scheme://host`, all
//! others against the bare host (including any port).

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN};

use aria_core::AcceptOptions;

/// Compiled origin patterns.
#[derive(Clone, Debug)]
pub struct OriginPolicy {
    hosts: GlobSet,
    origins: GlobSet,
    skip_verify: bool,
}

impl OriginPolicy {
    /// Compile `patterns`. Fails on the first malformed glob.
    pub fn new<S: AsRef<str>>(patterns: &[S], skip_verify: bool) -> Result<Self, String> {
        let mut hosts = GlobSetBuilder::new();
        let mut origins = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|e| format!("invalid origin pattern {pattern:?}: {e}"))?;
            let _ = if pattern.contains("://") {
                origins.add(glob)
            } else {
                hosts.add(glob)
            };
        }
        Ok(Self {
            hosts: hosts.build().map_err(|e| e.to_string())?,
            origins: origins.build().map_err(|e| e.to_string())?,
            skip_verify,
        })
    }

    /// Compile the policy described by `options`.
    pub fn from_options(options: &AcceptOptions) -> Result<Self, String> {
        Self::new(&options.origin_patterns, options.insecure_skip_verify)
    }

    /// Check the handshake headers. The error is the rejection reason.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), String> {
        let Some(origin) = headers.get(ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| "origin header is not valid ASCII".to_string())?;
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();

        if self.is_allowed(origin, host) {
            Ok(())
        } else {
            Err(format!("request origin {origin:?} is not authorized for host {host:?}"))
        }
    }

    /// Whether `origin` may connect to a server reached as `host`.
    pub fn is_allowed(&self, origin: &str, host: &str) -> bool {
        if self.skip_verify {
            return true;
        }
        let Some((scheme, origin_host)) = split_origin(origin) else {
            return false;
        };
        if origin_host.eq_ignore_ascii_case(host) {
            return true;
        }
        self.hosts.is_match(origin_host)
            || self.origins.is_match(format!("{scheme}://{origin_host}"))
    }
}

/// Split `scheme://host[/...]` into scheme and host.
fn split_origin(origin: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = origin.split_once("://")?;
    let host = rest.split('/').next().unwrap_or_default();
    if scheme.is_empty() || host.is_empty() {
        return None;
    }
    Some((scheme, host))
}
