//! Realm routing: map a User-Name to an ordered list of upstream candidates.
//!
//! Realms are matched in configuration order against the full User-Name,
//! case-insensitively; the first match wins. Server selection prefers an
//! upstream that is connected and answering its liveness probes, then the
//! one with the fewest consecutively lost probes, and finally falls back to
//! the first configured candidate so retries can bring a dead server back.

use crate::config::ConfigError;
use crate::session::Upstream;
use regex::{Regex, RegexBuilder};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Realm {
    pub name: String,
    regex: Regex,
    /// Reply-Message for an Access-Reject when no candidate is available
    pub message: Option<String>,
    /// Ordered upstream candidates
    pub servers: Vec<Arc<Upstream>>,
}

/// Translate a realm pattern into a regular expression: `/regex/` is taken
/// verbatim (trailing `/` optional), `*` alone matches anything, and a plain
/// string becomes an `@literal$` suffix match with dots escaped.
pub fn pattern_to_regex(pattern: &str) -> String {
    if let Some(regex) = pattern.strip_prefix('/') {
        return regex.strip_suffix('/').unwrap_or(regex).to_string();
    }
    if pattern == "*" {
        return ".*".to_string();
    }
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('@');
    for c in pattern.chars() {
        if c == '.' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('$');
    out
}

impl Realm {
    pub fn new(
        pattern: &str,
        message: Option<String>,
        servers: Vec<Arc<Upstream>>,
    ) -> Result<Self, ConfigError> {
        let regex_pattern = pattern_to_regex(pattern);
        let regex = RegexBuilder::new(&regex_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|error| ConfigError::Regex {
                pattern: regex_pattern,
                error,
            })?;
        Ok(Realm {
            name: pattern.to_string(),
            regex,
            message,
            servers,
        })
    }

    pub fn matches(&self, username: &str) -> bool {
        self.regex.is_match(username)
    }

    /// Pick the best candidate for a new request.
    pub fn best_server(&self) -> Option<Arc<Upstream>> {
        let mut best: Option<&Arc<Upstream>> = None;
        for server in &self.servers {
            if !server.connection_ok.load(Ordering::Relaxed) {
                continue;
            }
            let lost = server.lost_status.load(Ordering::Relaxed);
            if lost == 0 {
                return Some(server.clone());
            }
            match best {
                Some(current)
                    if current.lost_status.load(Ordering::Relaxed) <= lost => {}
                _ => best = Some(server),
            }
        }
        best.or(self.servers.first()).cloned()
    }
}

/// First realm whose pattern matches the username, in configuration order.
pub fn find_realm<'a>(realms: &'a [Realm], username: &str) -> Option<&'a Realm> {
    let realm = realms.iter().find(|realm| realm.matches(username));
    if let Some(realm) = realm {
        debug!(realm = %realm.name, "found matching realm");
    }
    realm
}
