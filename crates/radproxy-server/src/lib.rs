//! Realm-routing RADIUS/RadSec proxy engine.
//!
//! The proxy terminates RADIUS on UDP or TLS, routes each Access-Request to
//! an upstream server chosen by the realm of its User-Name, re-encrypts
//! confidential attributes for every hop, and tracks upstream liveness with
//! Status-Server probes. Built on the `radproxy-proto` wire primitives.
//!
//! # Example
//!
//! ```rust,no_run
//! use radproxy_server::{Config, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("/etc/radproxy.conf")?;
//!     let proxy = Proxy::new(&config).await?;
//!     proxy.run(None).await?;
//!     Ok(())
//! }
//! ```

pub mod cert;
pub mod config;
pub mod error;
pub mod logging;
pub mod peers;
pub mod realm;
pub mod server;
pub mod session;
pub mod table;
pub mod tls;
pub mod transport;

pub use config::{Config, ConfigError, Transport};
pub use error::{ProxyError, ProxyResult};
pub use peers::PeerConfig;
pub use realm::Realm;
pub use server::{Proxy, ProxyState};
pub use session::{ClientHandle, Upstream};
pub use table::{RequestTable, MAX_REQUESTS};
