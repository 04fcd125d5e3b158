//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements the SSH protocol according to RFC 4251-4254.
//!
//! # Architecture
//!
//! The SSH implementation is layered:
//!
//! 1. **Wire Primitives** ([`wire`]) - Bounds-checked field encodings (RFC 4251 Section 5)
//! 2. **Packet Layer** ([`packet`], [`crypto`], [`compress`]) - Binary packet protocol (RFC 4253 Section 6)
//! 3. **Transport Layer** ([`transport`], [`kex`], [`kex_dh`]) - Key exchange, encryption, MAC (RFC 4253)
//! 4. **Authentication Layer** ([`auth`]) - User authentication (RFC 4252)
//! 5. **Connection Layer** ([`connection`], [`channel`]) - Channels and requests (RFC 4254)
//! 6. **Client/Server APIs** ([`client`], [`server`]) - Session drivers
//!
//! # Security Considerations
//!
//! - **Input Validation**: All packet parsing validates size limits (max 35000 bytes)
//! - **Constant-Time Operations**: MAC and password checks use constant-time comparisons
//! - **Memory Safety**: Secrets are zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::Packet;
//!
//! // Frame a payload for the default 8-byte block alignment
//! let packet = Packet::frame(b"SSH-MSG-KEXINIT payload".to_vec(), 8, false);
//! let bytes = packet.to_bytes();
//!
//! // Parse from wire format
//! let payload = Packet::extract_payload(&bytes[4..]).unwrap();
//! assert_eq!(payload, b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - DH Group Exchange
//! - [RFC 5656](https://datatracker.ietf.org/doc/html/rfc5656) - Elliptic Curve Algorithm Integration

pub mod asn1;
pub mod auth;
pub mod channel;
pub mod client;
pub mod compress;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod keyfile;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{
    constant_time_compare, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    AuthSequencer, InfoPrompt, InfoRequest, InfoResponse, MAX_PENDING_AUTH,
};
pub use channel::{Channel, ChannelTable, GlobalRequestQueue};
pub use client::{AuthOutcome, HostKeyInfo, HostKeyVerifier, SshClient, SshClientConfig};
pub use compress::CompressionAlgorithm;
pub use connection::{
    ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest,
    ChannelRequestType, ChannelType, ChannelWindowAdjust, ExtendedDataType, GlobalRequest,
    GlobalRequestType,
};
pub use crypto::{CipherAlgorithm, MacAlgorithm, MacKey, PacketCipher};
pub use hostkey::{
    fingerprint, verify_signature, DssHostKey, EcdsaP256HostKey, EcdsaP384HostKey,
    EcdsaP521HostKey, HostKey, HostKeyAlgorithm, RsaHostKey,
};
pub use kex::{negotiate, AlgorithmPreferences, KexInit, KexMethod, NegotiatedAlgorithms, NewKeys};
pub use kex_dh::{derive_key, DhExchange, EcdhExchange, KexHash};
pub use keyfile::{EncryptionInfo, KeyMaterial};
pub use message::{ChannelOpenFailureReason, DisconnectReason, MessageType};
pub use packet::Packet;
pub use server::{
    AuthDecision, AuthHandler, DenyAllAuth, KbdRound, SessionHandler, SshServer, SshServerConfig,
    SshServerSession,
};
pub use session::{KeepaliveHandle, KeepaliveRegistry, KeepaliveSignal};
pub use transport::{DirectionKeys, OutgoingStatus, Role, Transport};
pub use version::{PeerQuirks, Version};
pub use wire::{WireReader, WireWriter};
