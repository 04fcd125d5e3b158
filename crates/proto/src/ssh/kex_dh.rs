//! Key exchange mathematics: MODP Diffie-Hellman (static groups and group
//! exchange), ECDH over the NIST curves, the exchange hash, and session key
//! derivation (RFC 4253 Sections 7-8, RFC 4419, RFC 5656).
//!
//! # Hash agility
//!
//! Each kex method fixes its hash: the two static MODP groups always use
//! SHA-1; group exchange and ECDH derive theirs from the method name suffix.
//! [`KexHash`] carries that choice through the exchange hash and key
//! derivation.
//!
//! # Security
//!
//! - DH private exponents and shared secrets are zeroized on drop
//! - Peer DH public values are range-checked (1 < e < p-1)
//! - Group-exchange moduli outside the requested [1024, 8192] bit window
//!   are rejected

use crate::ssh::kex::KexMethod;
use crate::ssh::wire::{encode_mpint, WireWriter};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// Group-exchange minimal acceptable modulus size in bits.
pub const GEX_MIN_BITS: u32 = 1024;
/// Group-exchange preferred modulus size in bits.
pub const GEX_PREFERRED_BITS: u32 = 4096;
/// Group-exchange maximal acceptable modulus size in bits.
pub const GEX_MAX_BITS: u32 = 8192;

/// The hash algorithm a kex method binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-1 (static groups, group-exchange-sha1).
    Sha1,
    /// SHA-256 (group-exchange-sha256, nistp256).
    Sha256,
    /// SHA-384 (nistp384).
    Sha384,
    /// SHA-512 (nistp521).
    Sha512,
}

impl KexHash {
    /// Returns the hash used by a kex method. The static groups always use
    /// SHA-1; everything else follows the method-name suffix.
    pub fn for_method(method: KexMethod) -> Self {
        match method {
            KexMethod::DhGroup1Sha1 | KexMethod::DhGroup14Sha1 | KexMethod::DhGexSha1 => {
                KexHash::Sha1
            }
            KexMethod::DhGexSha256 | KexMethod::EcdhNistP256 => KexHash::Sha256,
            KexMethod::EcdhNistP384 => KexHash::Sha384,
            KexMethod::EcdhNistP521 => KexHash::Sha512,
        }
    }

    /// Returns the digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha384 => 48,
            KexHash::Sha512 => 64,
        }
    }

    /// Hashes `data` in one shot.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
            KexHash::Sha384 => Sha384::digest(data).to_vec(),
            KexHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// MODP group parameters (RFC 2409 group 2, RFC 3526 group 14).
mod groups {
    use super::*;

    /// 1024-bit Oakley Group 2 prime (diffie-hellman-group1-sha1).
    pub static MODP_GROUP1: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
                 FFFFFFFFFFFFFFFF",
            )
            .expect("Invalid hex"),
        )
    });

    /// 2048-bit MODP group 14 prime (diffie-hellman-group14-sha1).
    pub static MODP_GROUP14: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                 C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                 83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                 670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                 E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                 DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                 15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("Invalid hex"),
        )
    });

    /// Shared generator for both static groups.
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// A MODP Diffie-Hellman exchange over an explicit group.
///
/// Covers the static groups and the client side of group exchange (where the
/// server supplies `p` and `g` in KEX_DH_GEX_GROUP).
pub struct DhExchange {
    p: BigUint,
    g: BigUint,
    x: BigUint,
    public: Vec<u8>,
}

impl DhExchange {
    /// Creates an exchange over Oakley group 2 (group1).
    pub fn group1() -> Self {
        Self::from_group(groups::MODP_GROUP1.clone(), groups::GENERATOR.clone())
    }

    /// Creates an exchange over MODP group 14.
    pub fn group14() -> Self {
        Self::from_group(groups::MODP_GROUP14.clone(), groups::GENERATOR.clone())
    }

    /// Creates an exchange over an explicit group.
    pub fn from_group(p: BigUint, g: BigUint) -> Self {
        let mut rng = rand::thread_rng();
        let p_minus_one = &p - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = g.modpow(&x, &p);

        Self {
            public: y.to_bytes_be(),
            p,
            g,
            x,
        }
    }

    /// Creates a client-side exchange from a server's group-exchange reply.
    ///
    /// # Errors
    ///
    /// Rejects moduli outside the [`GEX_MIN_BITS`], [`GEX_MAX_BITS`] window.
    pub fn from_gex_group(p_bytes: &[u8], g_bytes: &[u8]) -> SkiffResult<Self> {
        let p = BigUint::from_bytes_be(p_bytes);
        let bits = p.bits() as u32;
        if !(GEX_MIN_BITS..=GEX_MAX_BITS).contains(&bits) {
            return Err(SkiffError::Protocol(format!(
                "Group exchange modulus of {} bits outside [{}, {}]",
                bits, GEX_MIN_BITS, GEX_MAX_BITS
            )));
        }
        Ok(Self::from_group(p, BigUint::from_bytes_be(g_bytes)))
    }

    /// Returns our public value (big-endian bytes of g^x mod p).
    pub fn public_value(&self) -> &[u8] {
        &self.public
    }

    /// Returns the group prime bytes (for the GEX exchange hash).
    pub fn prime_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    /// Returns the group generator bytes (for the GEX exchange hash).
    pub fn generator_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// Computes the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] when the peer value is outside
    /// (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkiffResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        if y_peer <= BigUint::from(1u32) || y_peer >= self.p {
            return Err(SkiffError::Protocol(
                "Invalid peer DH public value: out of range".to_string(),
            ));
        }
        let k = y_peer.modpow(&self.x, &self.p);
        Ok(k.to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        let mut x_bytes = self.x.to_bytes_be();
        x_bytes.zeroize();
        self.x = BigUint::from(0u32);
    }
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange")
            .field("bits", &self.p.bits())
            .field("x", &"<redacted>")
            .finish()
    }
}

/// An ephemeral ECDH exchange over one of the NIST curves.
pub enum EcdhExchange {
    /// NIST P-256.
    P256(p256::ecdh::EphemeralSecret),
    /// NIST P-384.
    P384(p384::ecdh::EphemeralSecret),
    /// NIST P-521.
    P521(p521::ecdh::EphemeralSecret),
}

impl EcdhExchange {
    /// Creates an exchange for the curve the kex method names.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for non-ECDH methods.
    pub fn new(method: KexMethod) -> SkiffResult<Self> {
        let mut rng = rand::thread_rng();
        match method {
            KexMethod::EcdhNistP256 => {
                Ok(Self::P256(p256::ecdh::EphemeralSecret::random(&mut rng)))
            }
            KexMethod::EcdhNistP384 => {
                Ok(Self::P384(p384::ecdh::EphemeralSecret::random(&mut rng)))
            }
            KexMethod::EcdhNistP521 => {
                Ok(Self::P521(p521::ecdh::EphemeralSecret::random(&mut rng)))
            }
            other => Err(SkiffError::Protocol(format!(
                "{} is not an ECDH method",
                other.name()
            ))),
        }
    }

    /// Returns our public value as an uncompressed SEC1 point.
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            Self::P256(secret) => p256::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
            Self::P384(secret) => p384::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
            Self::P521(secret) => p521::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
        }
    }

    /// Computes the shared secret (the x coordinate) from the peer's point.
    pub fn compute_shared_secret(&self, peer_point: &[u8]) -> SkiffResult<Vec<u8>> {
        let bad_point =
            || SkiffError::Protocol("Invalid peer ECDH public point".to_string());
        match self {
            Self::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_point).map_err(|_| bad_point())?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            Self::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_point).map_err(|_| bad_point())?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            Self::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_point).map_err(|_| bad_point())?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

impl std::fmt::Debug for EcdhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let curve = match self {
            Self::P256(_) => "nistp256",
            Self::P384(_) => "nistp384",
            Self::P521(_) => "nistp521",
        };
        f.debug_struct("EcdhExchange").field("curve", &curve).finish()
    }
}

/// Group-exchange negotiation fields carried into the exchange hash.
#[derive(Debug, Clone, Copy)]
pub struct GexHashParams<'a> {
    /// Minimal acceptable modulus bits, as requested.
    pub min: u32,
    /// Preferred modulus bits, as requested.
    pub preferred: u32,
    /// Maximal acceptable modulus bits, as requested.
    pub max: u32,
    /// Server-chosen prime.
    pub prime: &'a [u8],
    /// Server-chosen generator.
    pub generator: &'a [u8],
}

/// All inputs of the exchange hash H, assembled in the RFC's fixed order.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInputs<'a> {
    /// Client identification line (no CR LF).
    pub client_version: &'a str,
    /// Server identification line (no CR LF).
    pub server_version: &'a str,
    /// Client KEXINIT payload.
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload.
    pub server_kexinit: &'a [u8],
    /// Server host public key blob.
    pub host_key_blob: &'a [u8],
    /// Group-exchange fields, only for GEX methods.
    pub gex: Option<GexHashParams<'a>>,
    /// Client DH public value (e) or ECDH point (Q_C).
    pub client_public: &'a [u8],
    /// Server DH public value (f) or ECDH point (Q_S).
    pub server_public: &'a [u8],
    /// Shared secret K (raw big-endian bytes).
    pub shared_secret: &'a [u8],
    /// True for ECDH: public values are strings, not mpints.
    pub ecdh: bool,
}

/// Computes the exchange hash H over the assembled inputs.
pub fn compute_exchange_hash(hash: KexHash, inputs: &ExchangeHashInputs<'_>) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(inputs.client_version.as_bytes());
    w.put_string(inputs.server_version.as_bytes());
    w.put_string(inputs.client_kexinit);
    w.put_string(inputs.server_kexinit);
    w.put_string(inputs.host_key_blob);

    if let Some(gex) = &inputs.gex {
        w.put_u32(gex.min);
        w.put_u32(gex.preferred);
        w.put_u32(gex.max);
        w.put_mpint(gex.prime);
        w.put_mpint(gex.generator);
    }

    if inputs.ecdh {
        w.put_string(inputs.client_public);
        w.put_string(inputs.server_public);
    } else {
        w.put_mpint(inputs.client_public);
        w.put_mpint(inputs.server_public);
    }
    w.put_mpint(inputs.shared_secret);

    hash.digest(&w.into_bytes())
}

/// Derives session key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// Kn = HASH(K || H || K1 || ... || K(n-1))
/// key = K1 || K2 || ...   truncated to key_length
/// ```
///
/// Letters follow the fixed assignment: 'A'/'B' IVs, 'C'/'D' encryption
/// keys, 'E'/'F' MAC keys (client-to-server first in each pair). The loop
/// produces exactly `ceil(key_length / digest_len)` blocks.
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = encode_mpint(shared_secret);
    let digest_len = hash.digest_len();

    let mut key = Vec::with_capacity(key_length.div_ceil(digest_len) * digest_len);

    let mut first = Vec::with_capacity(k_mpint.len() + exchange_hash.len() + 1 + session_id.len());
    first.extend_from_slice(&k_mpint);
    first.extend_from_slice(exchange_hash);
    first.push(letter);
    first.extend_from_slice(session_id);
    key.extend_from_slice(&hash.digest(&first));

    while key.len() < key_length {
        let mut next = Vec::with_capacity(k_mpint.len() + exchange_hash.len() + key.len());
        next.extend_from_slice(&k_mpint);
        next.extend_from_slice(exchange_hash);
        next.extend_from_slice(&key);
        key.extend_from_slice(&hash.digest(&next));
    }

    key.truncate(key_length);
    key
}

/// Derives the full transport key schedule for both directions.
///
/// Returns `(outgoing, incoming)` for the given role. Letters follow
/// RFC 4253: client-to-server uses 'A'/'C'/'E' (IV/key/MAC), server-to-
/// client uses 'B'/'D'/'F'.
pub fn derive_transport_keys(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    negotiated: &crate::ssh::kex::NegotiatedAlgorithms,
    role: crate::ssh::transport::Role,
) -> (
    crate::ssh::transport::DirectionKeys,
    crate::ssh::transport::DirectionKeys,
) {
    use crate::ssh::transport::{DirectionKeys, Role};

    let derive = |letter: u8, len: usize| {
        derive_key(hash, shared_secret, exchange_hash, session_id, letter, len)
    };

    let c2s = DirectionKeys {
        cipher: negotiated.cipher_c2s,
        key: derive(b'C', negotiated.cipher_c2s.key_size()),
        iv: derive(b'A', negotiated.cipher_c2s.iv_size()),
        mac: negotiated.mac_c2s,
        mac_key: derive(b'E', negotiated.mac_c2s.key_size()),
        compression: negotiated.comp_c2s,
    };
    let s2c = DirectionKeys {
        cipher: negotiated.cipher_s2c,
        key: derive(b'D', negotiated.cipher_s2c.key_size()),
        iv: derive(b'B', negotiated.cipher_s2c.iv_size()),
        mac: negotiated.mac_s2c,
        mac_key: derive(b'F', negotiated.mac_s2c.key_size()),
        compression: negotiated.comp_s2c,
    };

    match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    }
}
