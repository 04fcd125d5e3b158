//! Packet payload compression (RFC 4253 Section 6.2).
//!
//! Supported algorithms: `none`, `zlib`, and the OpenSSH delayed variant
//! `zlib@openssh.com`, which negotiates like `zlib` but only activates after
//! user authentication succeeds.
//!
//! Compression is applied per logical packet payload with a partial flush,
//! keeping one deflate stream alive per direction for the life of the
//! negotiated keys.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{SkiffError, SkiffResult};

/// Negotiable compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// zlib deflate, active immediately after NEWKEYS.
    Zlib,
    /// zlib deflate, active only after successful user authentication.
    ZlibDelayed,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibDelayed => "zlib@openssh.com",
        }
    }

    /// Parses a compression algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibDelayed),
            _ => None,
        }
    }

    /// Returns whether this algorithm compresses at all.
    pub fn is_compressing(&self) -> bool {
        !matches!(self, CompressionAlgorithm::None)
    }

    /// Returns whether activation waits for user authentication.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibDelayed)
    }
}

/// Outgoing deflate stream for one direction.
pub struct Compressor {
    stream: Compress,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor").finish_non_exhaustive()
    }
}

impl Compressor {
    /// Creates a fresh deflate stream (zlib framing).
    pub fn new() -> Self {
        Self {
            stream: Compress::new(Compression::default(), true),
        }
    }

    /// Compresses one packet payload, flushing so the peer can decompress
    /// the packet without waiting for more input.
    pub fn compress(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            let before = self.stream.total_in();
            let status = self
                .stream
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("Compression failed: {}", e)))?;
            consumed += (self.stream.total_in() - before) as usize;

            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= payload.len() && out.capacity() > out.len() {
                        // Flush completed: zlib leaves spare output space
                        // once the partial flush marker is written.
                        return Ok(out);
                    }
                    out.reserve(out.capacity().max(64));
                }
                Status::StreamEnd => return Ok(out),
            }
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Incoming inflate stream for one direction.
pub struct Decompressor {
    stream: Decompress,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor").finish_non_exhaustive()
    }
}

impl Decompressor {
    /// Creates a fresh inflate stream (zlib framing).
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
        }
    }

    /// Decompresses one packet payload. `max_len` bounds the inflated size
    /// so a malicious peer cannot expand a packet without limit.
    pub fn decompress(&mut self, payload: &[u8], max_len: usize) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() * 2 + 64);
        let mut consumed = 0usize;
        loop {
            let before = self.stream.total_in();
            let status = self
                .stream
                .decompress_vec(&payload[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| SkiffError::Protocol(format!("Decompression failed: {}", e)))?;
            consumed += (self.stream.total_in() - before) as usize;

            if out.len() > max_len {
                return Err(SkiffError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    max_len
                )));
            }

            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= payload.len() && out.capacity() > out.len() {
                        return Ok(out);
                    }
                    out.reserve(out.capacity().max(64));
                }
                Status::StreamEnd => return Ok(out),
            }
        }
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Zlib.name(), "zlib");
        assert_eq!(
            CompressionAlgorithm::ZlibDelayed.name(),
            "zlib@openssh.com"
        );
        assert_eq!(
            CompressionAlgorithm::from_name("zlib@openssh.com"),
            Some(CompressionAlgorithm::ZlibDelayed)
        );
        assert_eq!(CompressionAlgorithm::from_name("lz4"), None);
    }

    #[test]
    fn test_delayed_flag() {
        assert!(!CompressionAlgorithm::Zlib.is_delayed());
        assert!(CompressionAlgorithm::ZlibDelayed.is_delayed());
        assert!(CompressionAlgorithm::ZlibDelayed.is_compressing());
        assert!(!CompressionAlgorithm::None.is_compressing());
    }

    #[test]
    fn test_round_trip_single_packet() {
        let mut c = Compressor::new();
        let mut d = Decompressor::new();

        let payload = b"channel data channel data channel data".to_vec();
        let compressed = c.compress(&payload).unwrap();
        let restored = d.decompress(&compressed, 35000).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_round_trip_stream_survives_packets() {
        // Partial flush per packet: a single pair of streams handles a
        // sequence of packets, each independently decodable.
        let mut c = Compressor::new();
        let mut d = Decompressor::new();

        for i in 0..10u8 {
            let payload = vec![i; 100 + i as usize];
            let compressed = c.compress(&payload).unwrap();
            let restored = d.decompress(&compressed, 35000).unwrap();
            assert_eq!(restored, payload, "packet {} corrupted", i);
        }
    }

    #[test]
    fn test_decompress_respects_max_len() {
        let mut c = Compressor::new();
        let mut d = Decompressor::new();

        let payload = vec![0u8; 4096];
        let compressed = c.compress(&payload).unwrap();
        assert!(d.decompress(&compressed, 1024).is_err());
    }
}
