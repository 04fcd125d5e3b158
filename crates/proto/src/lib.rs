//! Protocol implementations for the Skiff secure-transport stack.
//!
//! This crate provides a Rust implementation of the SSH2 protocol suite:
//!
//! - **Transport** - binary packet protocol, key exchange, rekeying (RFC 4253)
//! - **Authentication** - password, public key, host-based and
//!   keyboard-interactive methods (RFC 4252)
//! - **Connection** - multiplexed channels, global requests, flow control
//!   (RFC 4254)
//! - **Key codec** - OpenSSH PEM, RFC 4716 and PuTTY PPK v2 key files
//!
//! Both the client and the server role are implemented; see
//! [`ssh::client::SshClient`] and [`ssh::server::SshServer`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::Packet;
//!
//! // Frame and re-parse an SSH packet
//! let packet = Packet::frame(b"SSH message payload".to_vec(), 8, false);
//! let wire_format = packet.to_bytes();
//!
//! let payload = Packet::extract_payload(&wire_format[4..]).unwrap();
//! assert_eq!(payload, b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (RustCrypto, `rsa`,
//!   the `p256`/`p384`/`p521` curve crates)
//! - Constant-time comparisons for MACs and credentials
//! - Secure memory handling with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
