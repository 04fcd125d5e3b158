//! Key exchange negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - the SSH_MSG_KEXINIT / SSH_MSG_NEWKEYS codecs
//! - algorithm negotiation for every category (kex method, host key format,
//!   per-direction ciphers, MACs, compression)
//! - the "first KEX packet follows" guess handling
//!
//! Negotiation walks the *client's* ordered preference list per category and
//! picks the first entry that also appears anywhere in the server's list. A
//! category with no common entry is fatal and the error names the category.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::kex::{KexInit, negotiate};
//!
//! let client = KexInit::new_default();
//! let server = KexInit::new_default();
//! let negotiated = negotiate(&client, &server).unwrap();
//! assert_eq!(negotiated.kex.name(), "ecdh-sha2-nistp256");
//! ```

use crate::ssh::compress::CompressionAlgorithm;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{WireReader, WireWriter};
use skiff_platform::{SkiffError, SkiffResult};
use rand::RngCore;

/// A negotiable key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// diffie-hellman-group1-sha1 (1024-bit MODP, always SHA-1).
    DhGroup1Sha1,
    /// diffie-hellman-group14-sha1 (2048-bit MODP, always SHA-1).
    DhGroup14Sha1,
    /// diffie-hellman-group-exchange-sha1.
    DhGexSha1,
    /// diffie-hellman-group-exchange-sha256.
    DhGexSha256,
    /// ecdh-sha2-nistp256.
    EcdhNistP256,
    /// ecdh-sha2-nistp384.
    EcdhNistP384,
    /// ecdh-sha2-nistp521.
    EcdhNistP521,
}

impl KexMethod {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
            KexMethod::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexMethod::DhGexSha1 => "diffie-hellman-group-exchange-sha1",
            KexMethod::DhGexSha256 => "diffie-hellman-group-exchange-sha256",
            KexMethod::EcdhNistP256 => "ecdh-sha2-nistp256",
            KexMethod::EcdhNistP384 => "ecdh-sha2-nistp384",
            KexMethod::EcdhNistP521 => "ecdh-sha2-nistp521",
        }
    }

    /// Parses a kex method from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(KexMethod::DhGroup1Sha1),
            "diffie-hellman-group14-sha1" => Some(KexMethod::DhGroup14Sha1),
            "diffie-hellman-group-exchange-sha1" => Some(KexMethod::DhGexSha1),
            "diffie-hellman-group-exchange-sha256" => Some(KexMethod::DhGexSha256),
            "ecdh-sha2-nistp256" => Some(KexMethod::EcdhNistP256),
            "ecdh-sha2-nistp384" => Some(KexMethod::EcdhNistP384),
            "ecdh-sha2-nistp521" => Some(KexMethod::EcdhNistP521),
            _ => None,
        }
    }

    /// Returns whether this is a group-exchange method.
    pub fn is_group_exchange(&self) -> bool {
        matches!(self, KexMethod::DhGexSha1 | KexMethod::DhGexSha256)
    }
}

/// The complete result of one KEXINIT negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedAlgorithms {
    /// Chosen key exchange method.
    pub kex: KexMethod,
    /// Chosen server host key format.
    pub host_key: HostKeyAlgorithm,
    /// Cipher, client to server.
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_s2c: CipherAlgorithm,
    /// MAC, client to server (ignored on the wire when the cipher is AEAD).
    pub mac_c2s: MacAlgorithm,
    /// MAC, server to client.
    pub mac_s2c: MacAlgorithm,
    /// Compression, client to server.
    pub comp_c2s: CompressionAlgorithm,
    /// Compression, server to client.
    pub comp_s2c: CompressionAlgorithm,
}

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
///
/// Algorithm name-lists are ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// First KEX packet follows (guess optimization)
    pub first_kex_packet_follows: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl KexInit {
    /// Default kex proposal for the client role.
    pub fn new_default() -> Self {
        Self::with_algorithms(
            &[
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "ecdh-sha2-nistp521",
                "diffie-hellman-group-exchange-sha256",
                "diffie-hellman-group14-sha1",
                "diffie-hellman-group-exchange-sha1",
                "diffie-hellman-group1-sha1",
            ],
            &[
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "ssh-rsa",
                "ssh-dss",
            ],
        )
    }

    /// Default kex proposal for the server role.
    ///
    /// Group exchange is not offered: the server side of GEX is not
    /// implemented, so it must never win negotiation.
    pub fn new_default_server() -> Self {
        Self::with_algorithms(
            &[
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "ecdh-sha2-nistp521",
                "diffie-hellman-group14-sha1",
                "diffie-hellman-group1-sha1",
            ],
            &[
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "ssh-rsa",
                "ssh-dss",
            ],
        )
    }

    fn with_algorithms(kex: &[&str], host_keys: &[&str]) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = names(&[
            "aes128-ctr",
            "aes192-ctr",
            "aes256-ctr",
            "aes128-gcm@openssh.com",
            "aes256-gcm@openssh.com",
        ]);
        let macs = names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"]);
        let compression = names(&["none", "zlib@openssh.com", "zlib"]);

        Self {
            cookie,
            kex_algorithms: names(kex),
            server_host_key_algorithms: names(host_keys),
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: macs.clone(),
            mac_server_to_client: macs,
            compression_client_to_server: compression.clone(),
            compression_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Removes the group-exchange methods from the kex proposal (used when
    /// the peer's quirks disallow them).
    pub fn strip_group_exchange(&mut self) {
        self.kex_algorithms
            .retain(|name| !name.starts_with("diffie-hellman-group-exchange-"));
    }

    /// Serializes the KEXINIT message (without packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::KexInit as u8);
        w.put_raw(&self.cookie);
        w.put_name_list(&self.kex_algorithms);
        w.put_name_list(&self.server_host_key_algorithms);
        w.put_name_list(&self.encryption_client_to_server);
        w.put_name_list(&self.encryption_server_to_client);
        w.put_name_list(&self.mac_client_to_server);
        w.put_name_list(&self.mac_server_to_client);
        w.put_name_list(&self.compression_client_to_server);
        w.put_name_list(&self.compression_server_to_client);
        w.put_name_list(&self.languages_client_to_server);
        w.put_name_list(&self.languages_server_to_client);
        w.put_bool(self.first_kex_packet_follows);
        w.put_u32(0); // reserved
        w.into_bytes()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] on a wrong message type or any
    /// truncated field.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated KEXINIT message".to_string());

        let msg_type = r.take_u8().ok_or_else(truncated)?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.take_raw(16).ok_or_else(truncated)?);

        let kex_algorithms = r.take_name_list().ok_or_else(truncated)?;
        let server_host_key_algorithms = r.take_name_list().ok_or_else(truncated)?;
        let encryption_client_to_server = r.take_name_list().ok_or_else(truncated)?;
        let encryption_server_to_client = r.take_name_list().ok_or_else(truncated)?;
        let mac_client_to_server = r.take_name_list().ok_or_else(truncated)?;
        let mac_server_to_client = r.take_name_list().ok_or_else(truncated)?;
        let compression_client_to_server = r.take_name_list().ok_or_else(truncated)?;
        let compression_server_to_client = r.take_name_list().ok_or_else(truncated)?;
        let languages_client_to_server = r.take_name_list().ok_or_else(truncated)?;
        let languages_server_to_client = r.take_name_list().ok_or_else(truncated)?;
        let first_kex_packet_follows = r.take_bool().ok_or_else(truncated)?;
        let _reserved = r.take_u32().ok_or_else(truncated)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS (RFC 4253 Section 7.3): a single byte with value 21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        match data.first() {
            Some(&b) if b == MessageType::NewKeys as u8 => Ok(Self),
            Some(&b) => Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                b
            ))),
            None => Err(SkiffError::Protocol("NEWKEYS message is empty".to_string())),
        }
    }
}

/// Per-category ordered algorithm preference overrides
/// (the `algorithms.{kex,cipher,serverHostKey,hmac,compress}` configuration
/// surface). Every name is validated against the supported set at
/// construction time, before any wire activity.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmPreferences {
    /// Key exchange methods, most preferred first.
    pub kex: Option<Vec<String>>,
    /// Server host key formats.
    pub server_host_key: Option<Vec<String>>,
    /// Ciphers (both directions).
    pub cipher: Option<Vec<String>>,
    /// MACs (both directions).
    pub hmac: Option<Vec<String>>,
    /// Compression (both directions).
    pub compress: Option<Vec<String>>,
}

impl AlgorithmPreferences {
    /// Validates every configured name against the supported set.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] naming the offending entry. For the
    /// server role, group-exchange kex names are rejected too: the server
    /// side of GEX is not implemented.
    pub fn validate(&self, server_role: bool) -> SkiffResult<()> {
        if let Some(kex) = &self.kex {
            for name in kex {
                let method = KexMethod::from_name(name).ok_or_else(|| {
                    SkiffError::Config(format!("Unsupported kex algorithm: {}", name))
                })?;
                if server_role && method.is_group_exchange() {
                    return Err(SkiffError::Config(format!(
                        "{} is not supported in the server role",
                        name
                    )));
                }
            }
        }
        if let Some(host_keys) = &self.server_host_key {
            for name in host_keys {
                crate::ssh::hostkey::HostKeyAlgorithm::from_name(name).ok_or_else(|| {
                    SkiffError::Config(format!("Unsupported host key algorithm: {}", name))
                })?;
            }
        }
        if let Some(ciphers) = &self.cipher {
            for name in ciphers {
                CipherAlgorithm::from_name(name).ok_or_else(|| {
                    SkiffError::Config(format!("Unsupported cipher: {}", name))
                })?;
            }
        }
        if let Some(macs) = &self.hmac {
            for name in macs {
                MacAlgorithm::from_name(name).ok_or_else(|| {
                    SkiffError::Config(format!("Unsupported MAC: {}", name))
                })?;
            }
        }
        if let Some(compress) = &self.compress {
            for name in compress {
                CompressionAlgorithm::from_name(name).ok_or_else(|| {
                    SkiffError::Config(format!("Unsupported compression: {}", name))
                })?;
            }
        }
        Ok(())
    }

    /// Applies the overrides to a proposal.
    pub fn apply(&self, kexinit: &mut KexInit) {
        if let Some(kex) = &self.kex {
            kexinit.kex_algorithms = kex.clone();
        }
        if let Some(host_keys) = &self.server_host_key {
            kexinit.server_host_key_algorithms = host_keys.clone();
        }
        if let Some(ciphers) = &self.cipher {
            kexinit.encryption_client_to_server = ciphers.clone();
            kexinit.encryption_server_to_client = ciphers.clone();
        }
        if let Some(macs) = &self.hmac {
            kexinit.mac_client_to_server = macs.clone();
            kexinit.mac_server_to_client = macs.clone();
        }
        if let Some(compress) = &self.compress {
            kexinit.compression_client_to_server = compress.clone();
            kexinit.compression_server_to_client = compress.clone();
        }
    }
}

/// Picks the first entry of `client_list` that appears anywhere in
/// `server_list`. `category` names the failing category in the error.
fn first_match<'a>(
    category: &str,
    client_list: &'a [String],
    server_list: &[String],
) -> SkiffResult<&'a str> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .map(String::as_str)
        .ok_or_else(|| {
            SkiffError::Protocol(format!(
                "No matching {} algorithm: client={:?}, server={:?}",
                category, client_list, server_list
            ))
        })
}

/// Negotiates the full algorithm set from both sides' KEXINIT messages.
///
/// The client's preference order wins in every category; any category with
/// no common entry is a fatal error naming that category.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SkiffResult<NegotiatedAlgorithms> {
    let kex_name = first_match("key exchange", &client.kex_algorithms, &server.kex_algorithms)?;
    let kex = KexMethod::from_name(kex_name)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported kex method: {}", kex_name)))?;

    let hk_name = first_match(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let host_key = HostKeyAlgorithm::from_name(hk_name)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported host key format: {}", hk_name)))?;

    let c2s = first_match(
        "client-to-server cipher",
        &client.encryption_client_to_server,
        &server.encryption_client_to_server,
    )?;
    let cipher_c2s = CipherAlgorithm::from_name(c2s)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported cipher: {}", c2s)))?;

    let s2c = first_match(
        "server-to-client cipher",
        &client.encryption_server_to_client,
        &server.encryption_server_to_client,
    )?;
    let cipher_s2c = CipherAlgorithm::from_name(s2c)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported cipher: {}", s2c)))?;

    let mac_c2s_name = first_match(
        "client-to-server MAC",
        &client.mac_client_to_server,
        &server.mac_client_to_server,
    )?;
    let mac_c2s = MacAlgorithm::from_name(mac_c2s_name)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported MAC: {}", mac_c2s_name)))?;

    let mac_s2c_name = first_match(
        "server-to-client MAC",
        &client.mac_server_to_client,
        &server.mac_server_to_client,
    )?;
    let mac_s2c = MacAlgorithm::from_name(mac_s2c_name)
        .ok_or_else(|| SkiffError::Protocol(format!("Unsupported MAC: {}", mac_s2c_name)))?;

    let comp_c2s_name = first_match(
        "client-to-server compression",
        &client.compression_client_to_server,
        &server.compression_client_to_server,
    )?;
    let comp_c2s = CompressionAlgorithm::from_name(comp_c2s_name).ok_or_else(|| {
        SkiffError::Protocol(format!("Unsupported compression: {}", comp_c2s_name))
    })?;

    let comp_s2c_name = first_match(
        "server-to-client compression",
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?;
    let comp_s2c = CompressionAlgorithm::from_name(comp_s2c_name).ok_or_else(|| {
        SkiffError::Protocol(format!("Unsupported compression: {}", comp_s2c_name))
    })?;

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        comp_c2s,
        comp_s2c,
    })
}

/// Returns true when the peer announced a guessed first kex packet that does
/// not match the negotiated method — the next kex-range packet from that
/// peer must be ignored (one-shot).
pub fn guess_mismatched(peer: &KexInit, negotiated: KexMethod) -> bool {
    peer.first_kex_packet_follows
        && peer
            .kex_algorithms
            .first()
            .map(|first| first != negotiated.name())
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::new_default();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut data = vec![99];
        data.extend_from_slice(&[0u8; 40]);
        assert!(KexInit::from_bytes(&data).is_err());
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let data = vec![20, 1, 2, 3];
        assert!(KexInit::from_bytes(&data).is_err());
    }

    #[test]
    fn test_negotiate_defaults() {
        let client = KexInit::new_default();
        let server = KexInit::new_default_server();
        let n = negotiate(&client, &server).unwrap();
        assert_eq!(n.kex, KexMethod::EcdhNistP256);
        assert_eq!(n.host_key.name(), "ecdsa-sha2-nistp256");
        assert_eq!(n.cipher_c2s, CipherAlgorithm::Aes128Ctr);
        assert_eq!(n.mac_c2s, MacAlgorithm::HmacSha256);
        assert_eq!(n.comp_c2s, CompressionAlgorithm::None);
    }

    #[test]
    fn test_negotiate_client_preference_wins() {
        let mut client = KexInit::new_default();
        let mut server = KexInit::new_default_server();
        client.encryption_client_to_server =
            names(&["aes256-ctr", "aes128-ctr"]);
        server.encryption_client_to_server =
            names(&["aes128-ctr", "aes256-ctr"]);

        let n = negotiate(&client, &server).unwrap();
        assert_eq!(n.cipher_c2s, CipherAlgorithm::Aes256Ctr);
    }

    #[test]
    fn test_negotiate_no_match_names_category() {
        let mut client = KexInit::new_default();
        let server = KexInit::new_default_server();
        client.mac_server_to_client = names(&["hmac-sha1-96"]);

        match negotiate(&client, &server) {
            Err(SkiffError::Protocol(msg)) => {
                assert!(msg.contains("server-to-client MAC"), "got: {}", msg);
            }
            other => panic!("Expected protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_negotiate_gex_never_against_default_server() {
        let mut client = KexInit::new_default();
        client.kex_algorithms = names(&[
            "diffie-hellman-group-exchange-sha256",
            "diffie-hellman-group14-sha1",
        ]);
        let server = KexInit::new_default_server();
        let n = negotiate(&client, &server).unwrap();
        assert_eq!(n.kex, KexMethod::DhGroup14Sha1);
    }

    #[test]
    fn test_guess_mismatch() {
        let mut peer = KexInit::new_default();
        assert!(!guess_mismatched(&peer, KexMethod::EcdhNistP256));

        peer.first_kex_packet_follows = true;
        // First entry is ecdh-sha2-nistp256, so a group14 outcome mismatches.
        assert!(guess_mismatched(&peer, KexMethod::DhGroup14Sha1));
        assert!(!guess_mismatched(&peer, KexMethod::EcdhNistP256));
    }

    #[test]
    fn test_strip_group_exchange() {
        let mut kexinit = KexInit::new_default();
        kexinit.strip_group_exchange();
        assert!(kexinit
            .kex_algorithms
            .iter()
            .all(|n| !n.contains("group-exchange")));
    }

    #[test]
    fn test_newkeys_round_trip() {
        let bytes = NewKeys::new().to_bytes();
        assert_eq!(bytes, vec![21]);
        assert_eq!(NewKeys::from_bytes(&bytes).unwrap(), NewKeys::new());
        assert!(NewKeys::from_bytes(&[20]).is_err());
        assert!(NewKeys::from_bytes(&[]).is_err());
    }
}
