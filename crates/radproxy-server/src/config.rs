//! Proxy configuration
//!
//! The configuration file is JSON deserialized into the typed dictionaries
//! consumed by the orchestrator: `clients`, `servers`, `realms`, `tls`,
//! `rewrites`, plus process-global options. `Config::validate` performs the
//! cross-reference checks that make a load fatal (unknown TLS or rewrite
//! references, realms naming unknown servers, missing secrets); compilation
//! into runtime state happens in [`crate::peers`] and [`crate::server`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid regular expression '{pattern}': {error}")]
    Regex { pattern: String, error: regex::Error },
    #[error("Cannot resolve host '{host}': {error}")]
    Resolve { host: String, error: std::io::Error },
}

/// Default RADIUS authentication port (RFC 2865)
pub const DEFAULT_UDP_PORT: u16 = 1812;
/// Default RADIUS accounting port (RFC 2866)
pub const DEFAULT_ACCOUNTING_PORT: u16 = 1813;
/// Default RadSec port (RFC 6614)
pub const DEFAULT_TLS_PORT: u16 = 2083;
/// Shared secret mandated for RadSec when none is configured (RFC 6614)
pub const DEFAULT_TLS_SECRET: &str = "radsec";

/// Peer transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tls,
}

/// Inbound peer definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDef {
    /// Optional display name; defaults to the host
    #[serde(default)]
    pub name: Option<String>,
    /// Transport this client uses
    #[serde(rename = "type")]
    pub transport: Transport,
    /// Address, hostname, or CIDR prefix (UDP only)
    pub host: String,
    /// Shared secret; defaults to "radsec" for TLS clients
    #[serde(default)]
    pub secret: Option<String>,
    /// Name of the TLS context used to terminate this client
    #[serde(default)]
    pub tls: Option<String>,
    /// Certificate constraint: "CN:/regex/" or "SubjectAltName:URI:/regex/"
    #[serde(default)]
    pub match_cert_attr: Option<String>,
    /// Name of the rewrite rule set applied to this client's requests
    #[serde(default)]
    pub rewrite: Option<String>,
    /// Username rewrite: "User-Name:/regex/replacement/"
    #[serde(default)]
    pub rewrite_attr: Option<String>,
}

/// Upstream peer definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDef {
    /// Unique name realms refer to
    pub name: String,
    #[serde(rename = "type")]
    pub transport: Transport,
    pub host: String,
    /// Destination port; defaults to 1812 (UDP) or 2083 (TLS)
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub tls: Option<String>,
    #[serde(default)]
    pub match_cert_attr: Option<String>,
    /// Rewrite rule set applied to this server's replies
    #[serde(default)]
    pub rewrite: Option<String>,
    /// Probe this server with Status-Server requests
    #[serde(default)]
    pub status_server: bool,
}

/// Realm routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmDef {
    /// Realm pattern: "/regex/", "*", or a literal realm suffix
    pub pattern: String,
    /// Ordered upstream candidates by server name
    #[serde(default)]
    pub servers: Vec<String>,
    /// Reply-Message sent in an Access-Reject when no server is available
    #[serde(default)]
    pub reply_message: Option<String>,
}

/// Named TLS context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsDef {
    pub name: String,
    #[serde(default)]
    pub ca_cert_file: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    pub cert_file: String,
    pub cert_key_file: String,
    #[serde(default)]
    pub cert_key_password: Option<String>,
}

/// Named attribute-removal rule set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteDef {
    pub name: String,
    /// Attribute type codes to drop
    #[serde(default)]
    pub remove_attrs: Vec<u8>,
    /// Vendor rules: "311" drops the whole VSA, "311:16" one sub-attribute
    #[serde(default)]
    pub remove_vendor_attrs: Vec<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// UDP authentication listener, "host:port" or "host"
    #[serde(default)]
    pub listen_udp: Option<String>,
    /// TLS listener
    #[serde(default)]
    pub listen_tcp: Option<String>,
    /// UDP accounting listener; disabled when unset
    #[serde(default)]
    pub listen_accounting_udp: Option<String>,
    /// Source address for upstream UDP sockets
    #[serde(default)]
    pub source_udp: Option<String>,
    /// Source address for upstream TLS connections
    #[serde(default)]
    pub source_tcp: Option<String>,
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default)]
    pub log_level: Option<String>,
    /// Log file; stderr when running in the foreground
    #[serde(default)]
    pub log_destination: Option<String>,
    /// PID file path
    #[serde(default)]
    pub pid_file: Option<String>,

    #[serde(default)]
    pub clients: Vec<ClientDef>,
    #[serde(default)]
    pub servers: Vec<ServerDef>,
    #[serde(default)]
    pub realms: Vec<RealmDef>,
    #[serde(default)]
    pub tls: Vec<TlsDef>,
    #[serde(default)]
    pub rewrites: Vec<RewriteDef>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference and completeness checks. A proxy without at least one
    /// client, server and realm has nothing to do and refuses to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::Invalid("no clients configured".into()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".into()));
        }
        if self.realms.is_empty() {
            return Err(ConfigError::Invalid("no realms configured".into()));
        }

        let tls_names: HashSet<&str> = self.tls.iter().map(|t| t.name.as_str()).collect();
        let rewrite_names: HashSet<&str> =
            self.rewrites.iter().map(|r| r.name.as_str()).collect();

        let mut server_names = HashSet::new();
        for server in &self.servers {
            if !server_names.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        for (host, transport, secret, tls, rewrite) in self
            .clients
            .iter()
            .map(|c| (&c.host, c.transport, &c.secret, &c.tls, &c.rewrite))
            .chain(
                self.servers
                    .iter()
                    .map(|s| (&s.host, s.transport, &s.secret, &s.tls, &s.rewrite)),
            )
        {
            match transport {
                Transport::Udp => {
                    if secret.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "UDP peer '{host}' has no secret"
                        )));
                    }
                }
                Transport::Tls => {
                    let Some(tls) = tls else {
                        return Err(ConfigError::Invalid(format!(
                            "TLS peer '{host}' references no TLS context"
                        )));
                    };
                    if !tls_names.contains(tls.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "TLS peer '{host}' references unknown TLS context '{tls}'"
                        )));
                    }
                }
            }
            if let Some(rewrite) = rewrite {
                if !rewrite_names.contains(rewrite.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "peer '{host}' references unknown rewrite '{rewrite}'"
                    )));
                }
            }
        }

        for tls in &self.tls {
            if tls.ca_cert_file.is_none() && tls.ca_cert_path.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "TLS context '{}' has neither ca_cert_file nor ca_cert_path",
                    tls.name
                )));
            }
            if tls.cert_key_password.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "TLS context '{}': encrypted private keys are not supported",
                    tls.name
                )));
            }
        }

        for realm in &self.realms {
            for server in &realm.servers {
                if !server_names.contains(server.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "realm '{}' references unknown server '{}'",
                        realm.pattern, server
                    )));
                }
            }
            if let Some(message) = &realm.reply_message {
                if message.len() > 253 {
                    return Err(ConfigError::Invalid(format!(
                        "realm '{}': reply_message exceeds 253 bytes",
                        realm.pattern
                    )));
                }
            }
        }

        for rewrite in &self.rewrites {
            for vendor in &rewrite.remove_vendor_attrs {
                parse_vendor_attr(vendor)?;
            }
        }

        for def in self.clients.iter().map(|c| &c.match_cert_attr).chain(
            self.servers.iter().map(|s| &s.match_cert_attr),
        ) {
            if let Some(value) = def {
                parse_match_cert_attr(value)?;
            }
        }
        for def in &self.clients {
            if let Some(value) = &def.rewrite_attr {
                parse_rewrite_attr(value)?;
            }
        }

        Ok(())
    }
}

/// Which certificate attribute a `match_cert_attr` constraint applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertAttr {
    CommonName,
    SubjectAltNameUri,
}

/// Parse "CN:/regex/" or "SubjectAltName:URI:/regex/".
pub fn parse_match_cert_attr(value: &str) -> Result<(CertAttr, String), ConfigError> {
    let (attr, rest) = if let Some(rest) = value.strip_prefix("CN:/") {
        (CertAttr::CommonName, rest)
    } else if let Some(rest) = value.strip_prefix("SubjectAltName:URI:/") {
        (CertAttr::SubjectAltNameUri, rest)
    } else {
        return Err(ConfigError::Invalid(format!(
            "invalid match_cert_attr '{value}'"
        )));
    };
    let pattern = rest.strip_suffix('/').unwrap_or(rest);
    if pattern.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "empty regex in match_cert_attr '{value}'"
        )));
    }
    Ok((attr, pattern.to_string()))
}

/// Parse "User-Name:/regex/replacement/".
pub fn parse_rewrite_attr(value: &str) -> Result<(String, String), ConfigError> {
    let rest = value.strip_prefix("User-Name:/").ok_or_else(|| {
        ConfigError::Invalid(format!("invalid rewrite_attr '{value}'"))
    })?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let (pattern, replacement) = rest.split_once('/').ok_or_else(|| {
        ConfigError::Invalid(format!("rewrite_attr '{value}' has no replacement"))
    })?;
    if pattern.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "empty regex in rewrite_attr '{value}'"
        )));
    }
    Ok((pattern.to_string(), replacement.to_string()))
}

/// Parse a vendor drop rule: "311" removes the whole Vendor-Specific
/// attribute, "311:16" a single sub-attribute.
pub fn parse_vendor_attr(value: &str) -> Result<(u32, Option<u8>), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid vendor attribute '{value}'"));
    match value.split_once(':') {
        None => Ok((value.parse().map_err(|_| invalid())?, None)),
        Some((vendor, sub)) => Ok((
            vendor.parse().map_err(|_| invalid())?,
            Some(sub.parse().map_err(|_| invalid())?),
        )),
    }
}
