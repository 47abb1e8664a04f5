//! TLS certificate identity binding.
//!
//! After the rustls handshake has validated the chain against the context's
//! CA set, the peer's leaf certificate is bound to its configuration entry:
//! an IP-literal host must appear as a subjectAltName iPAddress, a hostname
//! as a dNSName (falling back to the subject CN when no dNSName is present),
//! and any configured CN or SAN-URI regex must additionally match. A peer
//! whose certificate fails the binding is treated as unknown.

use crate::peers::{HostSpec, PeerConfig};
use regex::Regex;
use std::net::IpAddr;
use tracing::{debug, warn};
use x509_parser::prelude::*;

enum SanMatch {
    Matched,
    PresentNoMatch,
    Absent,
}

fn san_names<'a>(cert: &'a X509Certificate<'a>) -> Vec<&'a GeneralName<'a>> {
    match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext.value.general_names.iter().collect(),
        _ => Vec::new(),
    }
}

fn san_ip_match(cert: &X509Certificate<'_>, ip: IpAddr) -> SanMatch {
    let expected: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let mut present = false;
    for name in san_names(cert) {
        if let GeneralName::IPAddress(bytes) = name {
            present = true;
            if *bytes == expected.as_slice() {
                return SanMatch::Matched;
            }
        }
    }
    if present {
        SanMatch::PresentNoMatch
    } else {
        SanMatch::Absent
    }
}

fn san_dns_match(cert: &X509Certificate<'_>, host: &str) -> SanMatch {
    let mut present = false;
    for name in san_names(cert) {
        if let GeneralName::DNSName(dns) = name {
            present = true;
            if dns.eq_ignore_ascii_case(host) {
                return SanMatch::Matched;
            }
        }
    }
    if present {
        SanMatch::PresentNoMatch
    } else {
        SanMatch::Absent
    }
}

fn san_uri_matches(cert: &X509Certificate<'_>, regex: &Regex) -> bool {
    san_names(cert).iter().any(|name| match name {
        GeneralName::URI(uri) => regex.is_match(uri),
        _ => false,
    })
}

fn common_names<'a>(cert: &'a X509Certificate<'a>) -> impl Iterator<Item = &'a str> {
    cert.subject()
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
}

fn cn_matches_exact(cert: &X509Certificate<'_>, host: &str) -> bool {
    common_names(cert).any(|cn| cn.eq_ignore_ascii_case(host))
}

fn cn_matches_regex(cert: &X509Certificate<'_>, regex: &Regex) -> bool {
    common_names(cert).any(|cn| regex.is_match(cn))
}

/// Bind a verified leaf certificate to a peer's configured identity.
pub fn verify_identity(cert_der: &[u8], peer: &PeerConfig) -> bool {
    let cert = match X509Certificate::from_der(cert_der) {
        Ok((_, cert)) => cert,
        Err(error) => {
            warn!(peer = %peer.name, %error, "cannot parse peer certificate");
            return false;
        }
    };

    if let HostSpec::Exact(_) = &peer.host_spec {
        if let Ok(ip) = peer.host.parse::<IpAddr>() {
            match san_ip_match(&cert, ip) {
                SanMatch::Matched => {}
                SanMatch::PresentNoMatch => {
                    debug!(peer = %peer.name, host = %peer.host, "no subjectAltName matching address");
                    return false;
                }
                SanMatch::Absent => {
                    if !cn_matches_exact(&cert, &peer.host) {
                        debug!(peer = %peer.name, host = %peer.host, "CN not matching address");
                        return false;
                    }
                }
            }
        } else {
            match san_dns_match(&cert, &peer.host) {
                SanMatch::Matched => {}
                SanMatch::PresentNoMatch => {
                    debug!(peer = %peer.name, host = %peer.host, "no subjectAltName matching host");
                    return false;
                }
                SanMatch::Absent => {
                    if !cn_matches_exact(&cert, &peer.host) {
                        debug!(peer = %peer.name, host = %peer.host, "CN not matching host");
                        return false;
                    }
                }
            }
        }
    }

    if let Some(regex) = &peer.cert_cn_regex {
        if !cn_matches_regex(&cert, regex) {
            debug!(peer = %peer.name, "CN not matching configured regex");
            return false;
        }
    }
    if let Some(regex) = &peer.cert_uri_regex {
        if !san_uri_matches(&cert, regex) {
            debug!(peer = %peer.name, "subjectAltName URI not matching configured regex");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use rcgen::{CertificateParams, DnType, Ia5String, KeyPair, SanType};
    use regex::RegexBuilder;

    fn make_cert(dns: &[&str], ips: &[&str], uris: &[&str], cn: Option<&str>) -> Vec<u8> {
        let mut params =
            CertificateParams::new(dns.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        for ip in ips {
            params
                .subject_alt_names
                .push(SanType::IpAddress(ip.parse().unwrap()));
        }
        for uri in uris {
            params
                .subject_alt_names
                .push(SanType::URI(Ia5String::try_from(uri.to_string()).unwrap()));
        }
        if let Some(cn) = cn {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn peer(host: &str, cn_regex: Option<&str>, uri_regex: Option<&str>) -> PeerConfig {
        let compile = |p: &str| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .unwrap()
        };
        PeerConfig {
            name: host.to_string(),
            transport: Transport::Tls,
            host: host.to_string(),
            host_spec: HostSpec::Exact(vec![]),
            port: 2083,
            secret: b"radsec".to_vec(),
            tls: None,
            cert_cn_regex: cn_regex.map(compile),
            cert_uri_regex: uri_regex.map(compile),
            rewrite: None,
            rewrite_username: None,
            status_server: false,
        }
    }

    #[test]
    fn test_dns_san_exact() {
        let cert = make_cert(&["radius.example.org"], &[], &[], None);
        assert!(verify_identity(&cert, &peer("radius.example.org", None, None)));
        assert!(verify_identity(&cert, &peer("RADIUS.EXAMPLE.ORG", None, None)));
        assert!(!verify_identity(&cert, &peer("other.example.org", None, None)));
    }

    #[test]
    fn test_ip_san_exact() {
        let cert = make_cert(&[], &["192.0.2.7"], &[], None);
        assert!(verify_identity(&cert, &peer("192.0.2.7", None, None)));
        assert!(!verify_identity(&cert, &peer("192.0.2.8", None, None)));
    }

    #[test]
    fn test_ip_host_with_dns_only_cert_falls_back_to_cn() {
        let cert = make_cert(&["radius.example.org"], &[], &[], Some("192.0.2.7"));
        // no iPAddress SANs present, so the CN may carry the address
        assert!(verify_identity(&cert, &peer("192.0.2.7", None, None)));
    }

    #[test]
    fn test_cn_fallback_for_hostname() {
        let cert = make_cert(&[], &[], &[], Some("radius.example.org"));
        assert!(verify_identity(&cert, &peer("radius.example.org", None, None)));
        assert!(!verify_identity(&cert, &peer("no.example.org", None, None)));
    }

    #[test]
    fn test_cn_regex_constraint() {
        let cert = make_cert(&["radius.example.org"], &[], &[], Some("idp-3.example.org"));
        assert!(verify_identity(
            &cert,
            &peer("radius.example.org", Some(r"^idp-\d+\.example\.org$"), None)
        ));
        assert!(!verify_identity(
            &cert,
            &peer("radius.example.org", Some(r"^sp-\d+\."), None)
        ));
    }

    #[test]
    fn test_uri_regex_constraint() {
        let cert = make_cert(
            &["radius.example.org"],
            &[],
            &["https://roaming.example.org/radsec"],
            None,
        );
        assert!(verify_identity(
            &cert,
            &peer("radius.example.org", None, Some(r"^https://roaming\."))
        ));
        assert!(!verify_identity(
            &cert,
            &peer("radius.example.org", None, Some(r"^urn:"))
        ));
    }

    #[test]
    fn test_garbage_certificate_rejected() {
        assert!(!verify_identity(&[0u8; 16], &peer("x", None, None)));
    }
}
