//! Orchestrator: compile the configuration into immutable runtime state,
//! bind the endpoints, spawn the task inventory and mind the signals.
//!
//! Steady state runs one reader/writer task pair per UDP listener, up to two
//! demux readers for upstream UDP traffic (one per address family), a writer
//! task per upstream (plus a reader task per TLS upstream), an accept loop
//! for RadSec, and a reader/writer pair per accepted TLS client.

use crate::config::{self, Config, ConfigError, Transport};
use crate::error::ProxyResult;
use crate::logging::LogHandle;
use crate::peers::{PeerConfig, PeerRefs};
use crate::realm::Realm;
use crate::session::{self, Upstream, UpstreamTransport};
use crate::tls::{build_context, TlsContext};
use crate::transport::tls::{tls_listener, TlsLink};
use crate::transport::udp;
use radproxy_proto::{Rewrite, VendorAttr};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Immutable runtime state shared by every task.
#[derive(Debug)]
pub struct ProxyState {
    pub clients: Vec<Arc<PeerConfig>>,
    pub servers: Vec<Arc<PeerConfig>>,
    /// One per server config, same order as `servers`
    pub upstreams: Vec<Arc<Upstream>>,
    pub realms: Vec<Realm>,
}

/// The proxy with its endpoints bound but not yet serving.
pub struct Proxy {
    state: Arc<ProxyState>,
    udp_auth: Option<Arc<UdpSocket>>,
    udp_acct: Option<Arc<UdpSocket>>,
    tcp: Option<TcpListener>,
    demux: Vec<Arc<UdpSocket>>,
}

fn resolve_addr(spec: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let (host, port) = match spec.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host, port.parse::<u16>().expect("checked above"))
        }
        _ => (spec, default_port),
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|error| ConfigError::Resolve {
            host: spec.to_string(),
            error,
        })?
        .next()
        .ok_or_else(|| ConfigError::Resolve {
            host: spec.to_string(),
            error: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })
}

fn resolve_listen(spec: Option<&str>, default_port: u16) -> Result<SocketAddr, ConfigError> {
    match spec {
        None => Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), default_port)),
        Some(spec) => resolve_addr(spec, default_port),
    }
}

impl Proxy {
    /// Compile the configuration and bind every endpoint. Fails fast on any
    /// configuration or bind problem.
    pub async fn new(config: &Config) -> ProxyResult<Self> {
        config.validate()?;

        let mut tls_contexts: HashMap<String, Arc<TlsContext>> = HashMap::new();
        for def in &config.tls {
            tls_contexts.insert(def.name.clone(), Arc::new(build_context(def)?));
        }

        let mut rewrites: HashMap<String, Arc<Rewrite>> = HashMap::new();
        for def in &config.rewrites {
            let mut remove_vendor_attrs = Vec::with_capacity(def.remove_vendor_attrs.len());
            for value in &def.remove_vendor_attrs {
                let (vendor, sub_type) = config::parse_vendor_attr(value)?;
                remove_vendor_attrs.push(VendorAttr { vendor, sub_type });
            }
            rewrites.insert(
                def.name.clone(),
                Arc::new(Rewrite {
                    remove_attrs: def.remove_attrs.clone(),
                    remove_vendor_attrs,
                }),
            );
        }

        let refs = PeerRefs {
            tls_contexts: &tls_contexts,
            rewrites: &rewrites,
        };
        let clients = config
            .clients
            .iter()
            .map(|def| PeerConfig::from_client(def, &refs).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let servers = config
            .servers
            .iter()
            .map(|def| PeerConfig::from_server(def, &refs).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let source_udp = match &config.source_udp {
            None => None,
            Some(spec) => Some(resolve_addr(spec, 0)?.ip()),
        };
        let source_tcp = match &config.source_tcp {
            None => None,
            Some(spec) => Some(resolve_addr(spec, 0)?),
        };

        // upstream UDP traffic shares one socket per address family
        let mut demux_v4: Option<Arc<UdpSocket>> = None;
        let mut demux_v6: Option<Arc<UdpSocket>> = None;
        let mut upstreams = Vec::with_capacity(servers.len());
        for conf in &servers {
            let transport = match conf.transport {
                Transport::Udp => {
                    let target = conf.first_target().ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "server '{}' has no resolved address",
                            conf.name
                        ))
                    })?;
                    let slot = if target.is_ipv4() { &mut demux_v4 } else { &mut demux_v6 };
                    if slot.is_none() {
                        let bind = SocketAddr::new(
                            source_udp.unwrap_or(if target.is_ipv4() {
                                Ipv4Addr::UNSPECIFIED.into()
                            } else {
                                Ipv6Addr::UNSPECIFIED.into()
                            }),
                            0,
                        );
                        *slot = Some(Arc::new(UdpSocket::bind(bind).await.map_err(
                            |error| ConfigError::Resolve {
                                host: bind.to_string(),
                                error,
                            },
                        )?));
                    }
                    UpstreamTransport::Udp {
                        socket: slot.as_ref().expect("bound above").clone(),
                        target,
                    }
                }
                Transport::Tls => UpstreamTransport::Tls(TlsLink::new(conf, source_tcp)?),
            };
            upstreams.push(Arc::new(Upstream::new(conf.clone(), transport)));
        }

        let by_name: HashMap<&str, Arc<Upstream>> = servers
            .iter()
            .zip(&upstreams)
            .map(|(conf, upstream)| (conf.name.as_str(), upstream.clone()))
            .collect();
        let realms = config
            .realms
            .iter()
            .map(|def| {
                let candidates = def
                    .servers
                    .iter()
                    .map(|name| by_name[name.as_str()].clone())
                    .collect();
                Realm::new(&def.pattern, def.reply_message.clone(), candidates)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let udp_auth = if clients.iter().any(|c| c.transport == Transport::Udp) {
            let addr = resolve_listen(config.listen_udp.as_deref(), config::DEFAULT_UDP_PORT)?;
            let socket = Arc::new(UdpSocket::bind(addr).await?);
            info!(addr = %socket.local_addr()?, "listening for UDP");
            Some(socket)
        } else {
            None
        };
        let udp_acct = match &config.listen_accounting_udp {
            None => None,
            Some(spec) => {
                let addr = resolve_listen(Some(spec), config::DEFAULT_ACCOUNTING_PORT)?;
                let socket = Arc::new(UdpSocket::bind(addr).await?);
                info!(addr = %socket.local_addr()?, "listening for accounting UDP");
                Some(socket)
            }
        };
        let tcp = if clients.iter().any(|c| c.transport == Transport::Tls) {
            let addr = resolve_listen(config.listen_tcp.as_deref(), config::DEFAULT_TLS_PORT)?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "listening for incoming TCP");
            Some(listener)
        } else {
            None
        };

        let mut demux = Vec::new();
        demux.extend(demux_v4);
        demux.extend(demux_v6);

        Ok(Proxy {
            state: Arc::new(ProxyState {
                clients,
                servers,
                upstreams,
                realms,
            }),
            udp_auth,
            udp_acct,
            tcp,
            demux,
        })
    }

    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    pub fn udp_listen_addr(&self) -> Option<SocketAddr> {
        self.udp_auth.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn acct_listen_addr(&self) -> Option<SocketAddr> {
        self.udp_acct.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn tls_listen_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Spawn the task inventory and serve until a termination signal.
    pub async fn run(self, log: Option<LogHandle>) -> ProxyResult<()> {
        let state = self.state;

        if let Some(socket) = self.udp_auth {
            tokio::spawn(udp::serve_listener(state.clone(), socket));
        }
        if let Some(socket) = self.udp_acct {
            tokio::spawn(udp::serve_listener(state.clone(), socket));
        }
        for socket in self.demux {
            tokio::spawn(udp::upstream_demux(state.clone(), socket));
        }
        for upstream in &state.upstreams {
            tokio::spawn(session::client_writer(upstream.clone()));
        }
        if let Some(listener) = self.tcp {
            tokio::spawn(tls_listener(state.clone(), listener));
        }
        info!(
            clients = state.clients.len(),
            servers = state.servers.len(),
            realms = state.realms.len(),
            "proxy running"
        );

        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt, shutting down");
                    return Ok(());
                }
                _ = terminate.recv() => {
                    info!("terminated, shutting down");
                    return Ok(());
                }
                _ = hangup.recv() => {
                    match &log {
                        Some(log) => log.reopen(),
                        None => warn!("SIGHUP with no log file to reopen"),
                    }
                }
            }
        }
    }
}
