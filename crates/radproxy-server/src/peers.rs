//! Peer table: runtime client and server configuration entries.
//!
//! A [`PeerConfig`] is the immutable, resolved counterpart of a `ClientDef`
//! or `ServerDef`: addresses are resolved, secrets defaulted, regexes
//! compiled and TLS/rewrite references bound. Lookups support a cursor so
//! several configs sharing an address can be disambiguated by later checks
//! (certificate constraints on TLS peers).

use crate::config::{
    self, CertAttr, ClientDef, ConfigError, ServerDef, Transport,
};
use crate::tls::TlsContext;
use ipnetwork::IpNetwork;
use radproxy_proto::Rewrite;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

/// Username rewrite rule: replace the User-Name value with `replacement`
/// (backreferences `\1`..`\9`) when `regex` matches.
#[derive(Debug, Clone)]
pub struct UsernameRewrite {
    pub regex: Regex,
    pub replacement: String,
}

/// Address portion of a peer: an exact host (all resolved addresses match)
/// or a CIDR prefix (UDP clients only).
#[derive(Debug, Clone)]
pub enum HostSpec {
    Exact(Vec<IpAddr>),
    Prefix(IpNetwork),
}

/// Resolved, immutable identity and policy of a peer.
#[derive(Debug)]
pub struct PeerConfig {
    pub name: String,
    pub transport: Transport,
    pub host: String,
    pub host_spec: HostSpec,
    /// Destination port; meaningful for servers only
    pub port: u16,
    pub secret: Vec<u8>,
    pub tls: Option<Arc<TlsContext>>,
    pub cert_cn_regex: Option<Regex>,
    pub cert_uri_regex: Option<Regex>,
    pub rewrite: Option<Arc<Rewrite>>,
    pub rewrite_username: Option<UsernameRewrite>,
    pub status_server: bool,
}

/// Strip the IPv4-mapped IPv6 wrapping so kernel-mapped addresses compare
/// equal to configured AF_INET entries.
pub fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| ConfigError::Regex {
            pattern: pattern.to_string(),
            error,
        })
}

fn resolve_host(host: &str, port: u16) -> Result<Vec<IpAddr>, ConfigError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(vec![canonical(addr)]);
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|error| ConfigError::Resolve {
            host: host.to_string(),
            error,
        })?
        .map(|sa| canonical(sa.ip()))
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(ConfigError::Resolve {
            host: host.to_string(),
            error: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

fn host_spec(host: &str, transport: Transport, port: u16) -> Result<HostSpec, ConfigError> {
    if host.contains('/') {
        if transport != Transport::Udp {
            return Err(ConfigError::Invalid(format!(
                "CIDR prefix '{host}' is only valid for UDP clients"
            )));
        }
        let network = host.parse::<IpNetwork>().map_err(|e| {
            ConfigError::Invalid(format!("invalid prefix '{host}': {e}"))
        })?;
        return Ok(HostSpec::Prefix(network));
    }
    Ok(HostSpec::Exact(resolve_host(host, port)?))
}

fn cert_regexes(
    match_cert_attr: Option<&str>,
) -> Result<(Option<Regex>, Option<Regex>), ConfigError> {
    let Some(value) = match_cert_attr else {
        return Ok((None, None));
    };
    let (attr, pattern) = config::parse_match_cert_attr(value)?;
    let regex = case_insensitive(&pattern)?;
    Ok(match attr {
        CertAttr::CommonName => (Some(regex), None),
        CertAttr::SubjectAltNameUri => (None, Some(regex)),
    })
}

impl PeerConfig {
    pub fn from_client(def: &ClientDef, refs: &PeerRefs<'_>) -> Result<Self, ConfigError> {
        let (cert_cn_regex, cert_uri_regex) = cert_regexes(def.match_cert_attr.as_deref())?;
        let rewrite_username = match &def.rewrite_attr {
            None => None,
            Some(value) => {
                let (pattern, replacement) = config::parse_rewrite_attr(value)?;
                Some(UsernameRewrite {
                    regex: case_insensitive(&pattern)?,
                    replacement,
                })
            }
        };
        Ok(PeerConfig {
            name: def.name.clone().unwrap_or_else(|| def.host.clone()),
            transport: def.transport,
            host: def.host.clone(),
            host_spec: host_spec(&def.host, def.transport, 0)?,
            port: 0,
            secret: secret_for(def.secret.as_deref(), def.transport),
            tls: lookup_tls(refs, def.tls.as_deref())?,
            cert_cn_regex,
            cert_uri_regex,
            rewrite: lookup_rewrite(refs, def.rewrite.as_deref())?,
            rewrite_username,
            status_server: false,
        })
    }

    pub fn from_server(def: &ServerDef, refs: &PeerRefs<'_>) -> Result<Self, ConfigError> {
        let port = def.port.unwrap_or(match def.transport {
            Transport::Udp => config::DEFAULT_UDP_PORT,
            Transport::Tls => config::DEFAULT_TLS_PORT,
        });
        let (cert_cn_regex, cert_uri_regex) = cert_regexes(def.match_cert_attr.as_deref())?;
        let spec = host_spec(&def.host, def.transport, port)?;
        if matches!(spec, HostSpec::Prefix(_)) {
            return Err(ConfigError::Invalid(format!(
                "server '{}' cannot use a CIDR prefix",
                def.name
            )));
        }
        Ok(PeerConfig {
            name: def.name.clone(),
            transport: def.transport,
            host: def.host.clone(),
            host_spec: spec,
            port,
            secret: secret_for(def.secret.as_deref(), def.transport),
            tls: lookup_tls(refs, def.tls.as_deref())?,
            cert_cn_regex,
            cert_uri_regex,
            rewrite: lookup_rewrite(refs, def.rewrite.as_deref())?,
            rewrite_username: None,
            status_server: def.status_server,
        })
    }

    /// Does `addr` belong to this peer? Exact hosts match any resolved
    /// address; prefixes contain the address.
    pub fn matches_addr(&self, addr: IpAddr) -> bool {
        let addr = canonical(addr);
        match &self.host_spec {
            HostSpec::Exact(addrs) => addrs.contains(&addr),
            HostSpec::Prefix(network) => network.contains(addr),
        }
    }

    /// First resolved destination for an upstream peer.
    pub fn first_target(&self) -> Option<SocketAddr> {
        match &self.host_spec {
            HostSpec::Exact(addrs) => addrs.first().map(|ip| SocketAddr::new(*ip, self.port)),
            HostSpec::Prefix(_) => None,
        }
    }
}

fn secret_for(secret: Option<&str>, transport: Transport) -> Vec<u8> {
    match secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => match transport {
            Transport::Tls => config::DEFAULT_TLS_SECRET.as_bytes().to_vec(),
            // config validation guarantees UDP peers carry a secret
            Transport::Udp => Vec::new(),
        },
    }
}

fn lookup_tls(
    refs: &PeerRefs<'_>,
    name: Option<&str>,
) -> Result<Option<Arc<TlsContext>>, ConfigError> {
    match name {
        None => Ok(None),
        Some(name) => refs
            .tls_contexts
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown TLS context '{name}'"))),
    }
}

fn lookup_rewrite(
    refs: &PeerRefs<'_>,
    name: Option<&str>,
) -> Result<Option<Arc<Rewrite>>, ConfigError> {
    match name {
        None => Ok(None),
        Some(name) => refs
            .rewrites
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown rewrite '{name}'"))),
    }
}

/// Shared lookup tables used while building peers.
pub struct PeerRefs<'a> {
    pub tls_contexts: &'a HashMap<String, Arc<TlsContext>>,
    pub rewrites: &'a HashMap<String, Arc<Rewrite>>,
}

/// Find the index of the first peer at or after `start` of the given
/// transport matching `addr`. Pass `found + 1` to continue the search.
pub fn find_peer(
    peers: &[Arc<PeerConfig>],
    transport: Transport,
    addr: IpAddr,
    start: usize,
) -> Option<usize> {
    let addr = canonical(addr);
    peers
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, peer)| peer.transport == transport && peer.matches_addr(addr))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> (
        HashMap<String, Arc<TlsContext>>,
        HashMap<String, Arc<Rewrite>>,
    ) {
        (HashMap::new(), HashMap::new())
    }

    fn udp_client(host: &str) -> ClientDef {
        ClientDef {
            name: None,
            transport: Transport::Udp,
            host: host.to_string(),
            secret: Some("s".to_string()),
            tls: None,
            match_cert_attr: None,
            rewrite: None,
            rewrite_attr: None,
        }
    }

    #[test]
    fn test_exact_host_match() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let peer = PeerConfig::from_client(&udp_client("192.0.2.1"), &refs).unwrap();
        assert!(peer.matches_addr("192.0.2.1".parse().unwrap()));
        assert!(!peer.matches_addr("192.0.2.2".parse().unwrap()));
    }

    #[test]
    fn test_prefix_match() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let peer = PeerConfig::from_client(&udp_client("10.1.0.0/16"), &refs).unwrap();
        assert!(peer.matches_addr("10.1.200.7".parse().unwrap()));
        assert!(!peer.matches_addr("10.2.0.1".parse().unwrap()));
        // family mismatch never matches
        assert!(!peer.matches_addr("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_v4_mapped_v6_unwrapped() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let peer = PeerConfig::from_client(&udp_client("192.0.2.1"), &refs).unwrap();
        assert!(peer.matches_addr("::ffff:192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_find_peer_cursor() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let peers: Vec<Arc<PeerConfig>> = vec![
            Arc::new(PeerConfig::from_client(&udp_client("192.0.2.1"), &refs).unwrap()),
            Arc::new(PeerConfig::from_client(&udp_client("10.0.0.0/8"), &refs).unwrap()),
            Arc::new(PeerConfig::from_client(&udp_client("192.0.2.1"), &refs).unwrap()),
        ];
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let first = find_peer(&peers, Transport::Udp, addr, 0).unwrap();
        assert_eq!(first, 0);
        let second = find_peer(&peers, Transport::Udp, addr, first + 1).unwrap();
        assert_eq!(second, 2);
        assert!(find_peer(&peers, Transport::Udp, addr, second + 1).is_none());
        assert!(find_peer(&peers, Transport::Tls, addr, 0).is_none());
    }

    #[test]
    fn test_prefix_rejected_for_tls() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let mut def = udp_client("10.0.0.0/8");
        def.transport = Transport::Tls;
        def.tls = None;
        assert!(PeerConfig::from_client(&def, &refs).is_err());
    }

    #[test]
    fn test_username_rewrite_compiled() {
        let (tls, rewrites) = refs();
        let refs = PeerRefs { tls_contexts: &tls, rewrites: &rewrites };
        let mut def = udp_client("192.0.2.1");
        def.rewrite_attr = Some(r"User-Name:/^(.*)@a$/\1@b/".to_string());
        let peer = PeerConfig::from_client(&def, &refs).unwrap();
        let rewrite = peer.rewrite_username.unwrap();
        assert!(rewrite.regex.is_match("ALICE@A"));
        assert_eq!(rewrite.replacement, r"\1@b");
    }
}
