//! Transport endpoints: UDP listeners and demux sockets, RadSec sessions.

pub mod tls;
pub mod udp;
