//! Host keys: SSH wire blob codecs, exchange-hash signing and signature
//! verification for the rsa/dss/ecdsa key families.
//!
//! # Signature encodings
//!
//! The crypto libraries work in their native encodings; the wire uses SSH's:
//!
//! - **ssh-rsa**: PKCS#1 v1.5 over SHA-1, signature bytes used as-is
//! - **ssh-dss**: SHA-1, then the DER `SEQUENCE { r, s }` is converted to
//!   the bare 40-byte `r ∥ s` form (and back for verification)
//! - **ecdsa-sha2-nistp{256,384,521}**: SHA-{256,384,512} by curve, with the
//!   DER signature converted to SSH's `mpint r ∥ mpint s` form (and back)
//!
//! The conversion helpers are public because the authentication layer needs
//! the same transformations for client public-key signatures.

use crate::ssh::asn1::{DerReader, DerWriter};
use crate::ssh::wire::{WireReader, WireWriter};
use base64::Engine;
use num_bigint::{BigUint, RandBigInt};
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// Host key algorithm (the negotiable server-host-key formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-rsa (PKCS#1 v1.5 with SHA-1)
    SshRsa,
    /// ssh-dss (DSA with SHA-1)
    SshDss,
    /// ecdsa-sha2-nistp256
    EcdsaP256,
    /// ecdsa-sha2-nistp384
    EcdsaP384,
    /// ecdsa-sha2-nistp521
    EcdsaP521,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::SshDss => "ssh-dss",
            HostKeyAlgorithm::EcdsaP256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaP384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaP521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parses a host key algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ssh-dss" => Some(HostKeyAlgorithm::SshDss),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaP256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaP384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaP521),
            _ => None,
        }
    }
}

/// A server host key: can encode its public blob and sign exchange hashes.
pub trait HostKey: Send + Sync {
    /// Returns the algorithm of this key.
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Returns the SSH wire public key blob.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data` and returns the SSH signature blob
    /// (`string algorithm ∥ string signature`).
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;

    /// Returns the algorithm name.
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Computes the `SHA256:` base64 fingerprint of a public key blob, as shown
/// to host-key verification callbacks.
pub fn fingerprint(public_key_blob: &[u8]) -> String {
    let digest = Sha256::digest(public_key_blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{}", encoded)
}

fn wrap_signature(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(4 + algorithm.len() + 4 + signature.len());
    w.put_string(algorithm.as_bytes());
    w.put_string(signature);
    w.into_bytes()
}

/// Splits an SSH signature blob into `(algorithm, signature bytes)`.
pub fn split_signature(blob: &[u8]) -> SkiffResult<(String, Vec<u8>)> {
    let mut r = WireReader::new(blob);
    let algorithm = r
        .take_utf8()
        .ok_or_else(|| SkiffError::Protocol("Truncated signature blob".to_string()))?;
    let signature = r
        .take_string()
        .ok_or_else(|| SkiffError::Protocol("Truncated signature blob".to_string()))?;
    Ok((algorithm, signature.to_vec()))
}

/// Reads the algorithm name out of an SSH public key blob.
pub fn blob_algorithm(blob: &[u8]) -> SkiffResult<String> {
    WireReader::new(blob)
        .take_utf8()
        .ok_or_else(|| SkiffError::Protocol("Truncated public key blob".to_string()))
}

// ---------------------------------------------------------------------------
// Signature encoding conversions
// ---------------------------------------------------------------------------

/// Converts a DER `SEQUENCE { r, s }` DSA signature to the bare 40-byte
/// `r ∥ s` wire form, each integer left-padded to 20 bytes.
pub fn dss_sig_der_to_bare(der: &[u8]) -> SkiffResult<Vec<u8>> {
    let mut outer = DerReader::new(der);
    let mut seq = outer.sequence()?;
    let r = seq.integer()?;
    let s = seq.integer()?;
    if r.len() > 20 || s.len() > 20 {
        return Err(SkiffError::Protocol(
            "DSA signature integer exceeds 160 bits".to_string(),
        ));
    }
    let mut out = vec![0u8; 40];
    out[20 - r.len()..20].copy_from_slice(r);
    out[40 - s.len()..].copy_from_slice(s);
    Ok(out)
}

/// Converts a bare 40-byte DSA signature to DER `SEQUENCE { r, s }`.
pub fn dss_sig_bare_to_der(bare: &[u8]) -> SkiffResult<Vec<u8>> {
    if bare.len() != 40 {
        return Err(SkiffError::Protocol(format!(
            "DSA signature must be 40 bytes, got {}",
            bare.len()
        )));
    }
    let mut w = DerWriter::new();
    w.sequence(|w| {
        w.integer(&bare[..20]);
        w.integer(&bare[20..]);
    });
    Ok(w.into_bytes())
}

/// Converts a DER ECDSA signature to SSH's `mpint r ∥ mpint s` form.
pub fn ecdsa_sig_der_to_ssh(der: &[u8]) -> SkiffResult<Vec<u8>> {
    let mut outer = DerReader::new(der);
    let mut seq = outer.sequence()?;
    let r = seq.integer()?;
    let s = seq.integer()?;
    let mut w = WireWriter::new();
    w.put_mpint(r);
    w.put_mpint(s);
    Ok(w.into_bytes())
}

/// Converts SSH's `mpint r ∥ mpint s` ECDSA signature data to DER.
pub fn ecdsa_sig_ssh_to_der(ssh: &[u8]) -> SkiffResult<Vec<u8>> {
    let mut r = WireReader::new(ssh);
    let truncated = || SkiffError::Protocol("Truncated ECDSA signature".to_string());
    let rr = r.take_mpint().ok_or_else(truncated)?;
    let ss = r.take_mpint().ok_or_else(truncated)?;
    let mut w = DerWriter::new();
    w.sequence(|w| {
        w.integer(rr);
        w.integer(ss);
    });
    Ok(w.into_bytes())
}

// ---------------------------------------------------------------------------
// RSA
// ---------------------------------------------------------------------------

/// RSA host key (`ssh-rsa`, PKCS#1 v1.5 with SHA-1).
pub struct RsaHostKey {
    key: rsa::RsaPrivateKey,
}

impl RsaHostKey {
    /// Generates a fresh key of `bits` length.
    pub fn generate(bits: usize) -> SkiffResult<Self> {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| SkiffError::Security(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Wraps an already-parsed private key.
    pub fn from_key(key: rsa::RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Verifies an `ssh-rsa` signature against a public key blob.
    pub fn verify(public_key_blob: &[u8], data: &[u8], signature: &[u8]) -> SkiffResult<bool> {
        let mut r = WireReader::new(public_key_blob);
        let truncated = || SkiffError::Protocol("Truncated ssh-rsa public key".to_string());
        let _alg = r.take_string().ok_or_else(truncated)?;
        let e = r.take_mpint().ok_or_else(truncated)?;
        let n = r.take_mpint().ok_or_else(truncated)?;

        let public = rsa::RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(n),
            rsa::BigUint::from_bytes_be(e),
        )
        .map_err(|e| SkiffError::Security(format!("Invalid RSA public key: {}", e)))?;

        let digest = Sha1::digest(data);
        Ok(public
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .is_ok())
    }
}

impl HostKey for RsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshRsa
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_string(b"ssh-rsa");
        w.put_mpint(&self.key.e().to_bytes_be());
        w.put_mpint(&self.key.n().to_bytes_be());
        w.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let digest = Sha1::digest(data);
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| SkiffError::Security(format!("RSA signing failed: {}", e)))?;
        Ok(wrap_signature("ssh-rsa", &signature))
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaHostKey").field("key", &"<redacted>").finish()
    }
}

// ---------------------------------------------------------------------------
// DSS
// ---------------------------------------------------------------------------

/// DSA host key (`ssh-dss`, SHA-1, 160-bit subgroup).
///
/// The modular arithmetic runs on `num-bigint`, the same engine the MODP
/// key exchanges use.
pub struct DssHostKey {
    p: BigUint,
    q: BigUint,
    g: BigUint,
    y: BigUint,
    x: BigUint,
}

impl DssHostKey {
    /// Builds a key from its components. `q` must be 160 bits: the wire
    /// format fixes the signature at 40 bytes.
    pub fn from_components(
        p: BigUint,
        q: BigUint,
        g: BigUint,
        y: BigUint,
        x: BigUint,
    ) -> SkiffResult<Self> {
        if q.bits() != 160 {
            return Err(SkiffError::Config(format!(
                "ssh-dss requires a 160-bit q, got {} bits",
                q.bits()
            )));
        }
        Ok(Self { p, q, g, y, x })
    }

    fn sign_raw(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let h = BigUint::from_bytes_be(&Sha1::digest(data));
        let one = BigUint::from(1u32);
        let two = BigUint::from(2u32);
        let mut rng = rand::thread_rng();

        loop {
            let k = rng.gen_biguint_range(&one, &self.q);
            let r = self.g.modpow(&k, &self.p) % &self.q;
            if r == BigUint::from(0u32) {
                continue;
            }
            // k^-1 via Fermat: q is prime.
            let k_inv = k.modpow(&(&self.q - &two), &self.q);
            let s = (&k_inv * (&h + &self.x * &r)) % &self.q;
            if s == BigUint::from(0u32) {
                continue;
            }

            // Native DER first, then the wire's bare 40-byte conversion.
            let mut w = DerWriter::new();
            w.sequence(|w| {
                w.integer(&r.to_bytes_be());
                w.integer(&s.to_bytes_be());
            });
            return dss_sig_der_to_bare(&w.into_bytes());
        }
    }

    /// Verifies an `ssh-dss` signature (bare 40-byte form) against a public
    /// key blob.
    pub fn verify(public_key_blob: &[u8], data: &[u8], signature: &[u8]) -> SkiffResult<bool> {
        let mut r = WireReader::new(public_key_blob);
        let truncated = || SkiffError::Protocol("Truncated ssh-dss public key".to_string());
        let _alg = r.take_string().ok_or_else(truncated)?;
        let p = BigUint::from_bytes_be(r.take_mpint().ok_or_else(truncated)?);
        let q = BigUint::from_bytes_be(r.take_mpint().ok_or_else(truncated)?);
        let g = BigUint::from_bytes_be(r.take_mpint().ok_or_else(truncated)?);
        let y = BigUint::from_bytes_be(r.take_mpint().ok_or_else(truncated)?);

        // Bare wire form back to DER, then to (r, s).
        let der = dss_sig_bare_to_der(signature)?;
        let mut outer = DerReader::new(&der);
        let mut seq = outer.sequence()?;
        let sig_r = BigUint::from_bytes_be(seq.integer()?);
        let sig_s = BigUint::from_bytes_be(seq.integer()?);

        let zero = BigUint::from(0u32);
        if sig_r == zero || sig_r >= q || sig_s == zero || sig_s >= q {
            return Ok(false);
        }

        let h = BigUint::from_bytes_be(&Sha1::digest(data));
        let two = BigUint::from(2u32);
        let w = sig_s.modpow(&(&q - &two), &q);
        let u1 = (&h * &w) % &q;
        let u2 = (&sig_r * &w) % &q;
        let v = (g.modpow(&u1, &p) * y.modpow(&u2, &p) % &p) % &q;

        Ok(v == sig_r)
    }
}

impl HostKey for DssHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshDss
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_string(b"ssh-dss");
        w.put_mpint(&self.p.to_bytes_be());
        w.put_mpint(&self.q.to_bytes_be());
        w.put_mpint(&self.g.to_bytes_be());
        w.put_mpint(&self.y.to_bytes_be());
        w.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let bare = self.sign_raw(data)?;
        Ok(wrap_signature("ssh-dss", &bare))
    }
}

impl Drop for DssHostKey {
    fn drop(&mut self) {
        let mut x_bytes = self.x.to_bytes_be();
        x_bytes.zeroize();
        self.x = BigUint::from(0u32);
    }
}

impl std::fmt::Debug for DssHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssHostKey").field("x", &"<redacted>").finish()
    }
}

// ---------------------------------------------------------------------------
// ECDSA
// ---------------------------------------------------------------------------

macro_rules! ecdsa_host_key {
    ($name:ident, $curve:ident, $algorithm:expr, $alg_name:literal, $curve_name:literal, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            key: $curve::ecdsa::SigningKey,
        }

        impl $name {
            /// Generates a fresh key.
            pub fn generate() -> SkiffResult<Self> {
                Ok(Self {
                    key: $curve::ecdsa::SigningKey::random(&mut rand::thread_rng()),
                })
            }

            /// Builds a key from the private scalar bytes. Leading zero
            /// bytes (mpint sign padding) are tolerated.
            pub fn from_scalar(d: &[u8]) -> SkiffResult<Self> {
                let mut d = d;
                while d.len() > 1 && d[0] == 0 {
                    d = &d[1..];
                }
                let key = $curve::ecdsa::SigningKey::from_slice(d).map_err(|_| {
                    SkiffError::Security(concat!("Invalid ", $curve_name, " private scalar").to_string())
                })?;
                Ok(Self { key })
            }

            /// Returns the uncompressed SEC1 public point.
            pub fn public_point(&self) -> Vec<u8> {
                $curve::ecdsa::VerifyingKey::from(&self.key)
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec()
            }

            /// Verifies a signature (SSH `mpint r ∥ mpint s` form) against a
            /// public key blob.
            pub fn verify(
                public_key_blob: &[u8],
                data: &[u8],
                signature: &[u8],
            ) -> SkiffResult<bool> {
                use $curve::ecdsa::signature::Verifier;

                let mut r = WireReader::new(public_key_blob);
                let truncated =
                    || SkiffError::Protocol("Truncated ECDSA public key".to_string());
                let _alg = r.take_string().ok_or_else(truncated)?;
                let _curve = r.take_string().ok_or_else(truncated)?;
                let point = r.take_string().ok_or_else(truncated)?;

                let vk = $curve::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|_| {
                    SkiffError::Security("Invalid ECDSA public point".to_string())
                })?;

                // SSH r,s form to DER for the verifier.
                let der = ecdsa_sig_ssh_to_der(signature)?;
                let sig = match $curve::ecdsa::Signature::from_der(&der) {
                    Ok(sig) => sig,
                    Err(_) => return Ok(false),
                };
                Ok(vk.verify(data, &sig).is_ok())
            }
        }

        impl HostKey for $name {
            fn algorithm(&self) -> HostKeyAlgorithm {
                $algorithm
            }

            fn public_key_blob(&self) -> Vec<u8> {
                let mut w = WireWriter::new();
                w.put_string($alg_name.as_bytes());
                w.put_string($curve_name.as_bytes());
                w.put_string(&self.public_point());
                w.into_bytes()
            }

            fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
                use $curve::ecdsa::signature::Signer;
                let sig: $curve::ecdsa::Signature = self.key.sign(data);
                // DER from the signer, SSH r,s form on the wire.
                let ssh_form = ecdsa_sig_der_to_ssh(sig.to_der().as_bytes())?;
                Ok(wrap_signature($alg_name, &ssh_form))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("key", &"<redacted>")
                    .finish()
            }
        }
    };
}

ecdsa_host_key!(
    EcdsaP256HostKey,
    p256,
    HostKeyAlgorithm::EcdsaP256,
    "ecdsa-sha2-nistp256",
    "nistp256",
    "ECDSA host key on NIST P-256 (`ecdsa-sha2-nistp256`, SHA-256)."
);
ecdsa_host_key!(
    EcdsaP384HostKey,
    p384,
    HostKeyAlgorithm::EcdsaP384,
    "ecdsa-sha2-nistp384",
    "nistp384",
    "ECDSA host key on NIST P-384 (`ecdsa-sha2-nistp384`, SHA-384)."
);
ecdsa_host_key!(
    EcdsaP521HostKey,
    p521,
    HostKeyAlgorithm::EcdsaP521,
    "ecdsa-sha2-nistp521",
    "nistp521",
    "ECDSA host key on NIST P-521 (`ecdsa-sha2-nistp521`, SHA-512)."
);

/// Verifies an SSH signature blob against a public key blob, dispatching on
/// the algorithm named inside the blob.
///
/// Returns `Ok(false)` for a well-formed but invalid signature; errors are
/// reserved for malformed input.
pub fn verify_signature(
    public_key_blob: &[u8],
    signature_blob: &[u8],
    data: &[u8],
) -> SkiffResult<bool> {
    let key_alg = blob_algorithm(public_key_blob)?;
    let (sig_alg, sig) = split_signature(signature_blob)?;
    if key_alg != sig_alg {
        return Ok(false);
    }

    match key_alg.as_str() {
        "ssh-rsa" => RsaHostKey::verify(public_key_blob, data, &sig),
        "ssh-dss" => DssHostKey::verify(public_key_blob, data, &sig),
        "ecdsa-sha2-nistp256" => EcdsaP256HostKey::verify(public_key_blob, data, &sig),
        "ecdsa-sha2-nistp384" => EcdsaP384HostKey::verify(public_key_blob, data, &sig),
        "ecdsa-sha2-nistp521" => EcdsaP521HostKey::verify(public_key_blob, data, &sig),
        other => Err(SkiffError::Protocol(format!(
            "Unsupported signature algorithm: {}",
            other
        ))),
    }
}
