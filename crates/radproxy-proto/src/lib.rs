//! RADIUS Protocol Primitives for the Proxy
//!
//! This crate provides the wire-level machinery the proxy engine is built
//! on, per RFC 2865, 2866, 2869, 2548 and 6614:
//!
//! - Raw-frame packet codec for UDP datagrams and length-prefixed TLS records
//! - Attribute-list validation and in-place attribute surgery
//! - Response signatures and Message-Authenticator HMACs
//! - User-Password / Tunnel-Password and MS-MPPE key re-encryption
//! - Configured attribute removal and username rewriting
//!
//! Everything operates on the exact wire bytes; a transformed frame is
//! always re-emittable byte-identically. No I/O happens here.
//!
//! # Example
//!
//! ```rust
//! use radproxy_proto::{Packet, Code, AttributeType};
//! use radproxy_proto::auth::{generate_request_authenticator, sign_response, verify_response};
//!
//! let req_auth = generate_request_authenticator();
//! let mut request = Packet::new(Code::AccessRequest, 7, req_auth);
//! request.push_attribute(AttributeType::UserName as u8, b"alice@example.org").unwrap();
//!
//! let mut reply = Packet::new(Code::AccessAccept, 7, req_auth);
//! sign_response(reply.as_bytes_mut(), b"secret");
//! assert!(verify_response(reply.as_bytes(), &req_auth, b"secret"));
//! ```

pub mod attrs;
pub mod auth;
pub mod code;
pub mod message_auth;
pub mod packet;
pub mod password;
pub mod rewrite;

pub use attrs::AttributeType;
pub use code::Code;
pub use packet::{Packet, PacketError};
pub use password::CryptoError;
pub use rewrite::{Rewrite, VendorAttr};
