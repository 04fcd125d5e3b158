//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include the MAC or the length field itself
//! - padding is at least 4 bytes and at most 255
//! - for classical ciphers the total (length field included) is a multiple
//!   of the cipher block size (minimum 8)
//! - for AEAD ciphers the length field is associated data and excluded from
//!   the alignment calculation (RFC 5647)
//! - received packets whose declared length exceeds the receive bound are a
//!   fatal "Bad packet length" error
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::packet::Packet;
//!
//! let packet = Packet::frame(b"SSH message payload".to_vec(), 8, false);
//! let bytes = packet.to_bytes();
//! let payload = Packet::extract_payload(&bytes[4..]).unwrap();
//! assert_eq!(payload, b"SSH message payload");
//! ```

use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Maximum payload-bearing packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Upper bound for a received `packet_length`, adjusted upward so a packet
/// whose payload grew under worst-case deflate expansion still fits.
pub const MAX_RECEIVE_LENGTH: usize = MAX_PACKET_SIZE + 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in the u8 field).
pub const MAX_PADDING_LEN: usize = 255;

/// A framed SSH packet: payload plus random padding. The MAC or AEAD tag is
/// applied by the transport after framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Frames a payload for a cipher with the given block size.
    ///
    /// Padding satisfies: at least 4 bytes, total aligned to
    /// `max(block_size, 8)`, and a randomized extra whole-block amount so
    /// packet lengths do not leak exact payload sizes. For AEAD ciphers pass
    /// `length_excluded = true`: the 4-byte length field is associated data
    /// and does not participate in alignment.
    ///
    /// # Panics
    ///
    /// Panics if the payload exceeds [`MAX_PACKET_SIZE`]; callers bound
    /// payload sizes before framing.
    pub fn frame(payload: Vec<u8>, block_size: usize, length_excluded: bool) -> Self {
        let block = block_size.max(8);

        // Bytes participating in the alignment: padding_length field +
        // payload + padding, plus the length field for classical ciphers.
        let fixed = 1 + payload.len() + if length_excluded { 0 } else { 4 };

        let mut padding_len = MIN_PADDING_LEN;
        while (fixed + padding_len) % block != 0 {
            padding_len += 1;
        }

        // Random whole-block fuzz, bounded by the one-byte field.
        let fuzz_blocks = (rand::thread_rng().next_u32() % 4) as usize;
        if padding_len + fuzz_blocks * block <= MAX_PADDING_LEN {
            padding_len += fuzz_blocks * block;
        }

        assert!(
            1 + payload.len() + padding_len <= MAX_PACKET_SIZE,
            "Packet size {} exceeds maximum {}",
            1 + payload.len() + padding_len,
            MAX_PACKET_SIZE
        );

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the wire `packet_length` value: padding_length field +
    /// payload + padding.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes to wire format without MAC/tag:
    /// `uint32 packet_length | byte padding_length | payload | padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf = Vec::with_capacity(4 + packet_length);
        buf.extend_from_slice(&(packet_length as u32).to_be_bytes());
        buf.push(self.padding.len() as u8);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.padding);
        buf
    }

    /// Extracts the payload from a decrypted packet body (the bytes after
    /// the length field: `padding_length | payload | padding`).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] when the body is empty, the padding
    /// is shorter than 4 bytes, or the padding does not fit the body.
    pub fn extract_payload(body: &[u8]) -> SkiffResult<&[u8]> {
        let (&padding_len, rest) = body
            .split_first()
            .ok_or_else(|| SkiffError::Protocol("Empty packet body".to_string()))?;
        let padding_len = padding_len as usize;

        if padding_len < MIN_PADDING_LEN {
            return Err(SkiffError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_len, MIN_PADDING_LEN
            )));
        }
        if padding_len > rest.len() {
            return Err(SkiffError::Protocol(format!(
                "Padding length {} exceeds packet body {}",
                padding_len,
                rest.len()
            )));
        }
        Ok(&rest[..rest.len() - padding_len])
    }

    /// Validates a received `packet_length` against the receive bound and
    /// the cipher block size.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for out-of-range or misaligned
    /// lengths ("Bad packet length").
    pub fn check_length(
        packet_length: usize,
        block_size: usize,
        length_excluded: bool,
    ) -> SkiffResult<()> {
        let block = block_size.max(8);
        if packet_length < 1 + MIN_PADDING_LEN || packet_length > MAX_RECEIVE_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Bad packet length: {}",
                packet_length
            )));
        }
        let aligned = if length_excluded {
            packet_length
        } else {
            packet_length + 4
        };
        if aligned % block != 0 {
            return Err(SkiffError::Protocol(format!(
                "Bad packet length: {} not aligned to cipher block size {}",
                packet_length, block
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_alignment_classical() {
        for payload_len in [0usize, 1, 7, 8, 100, 255] {
            let packet = Packet::frame(vec![0xaa; payload_len], 8, false);
            let total = 4 + packet.packet_length();
            assert_eq!(total % 8, 0, "payload_len {} misaligned", payload_len);
            assert!(packet.padding().len() >= MIN_PADDING_LEN);
            assert!(packet.padding().len() <= MAX_PADDING_LEN);
        }
    }

    #[test]
    fn test_frame_alignment_block16() {
        let packet = Packet::frame(vec![1; 13], 16, false);
        assert_eq!((4 + packet.packet_length()) % 16, 0);
    }

    #[test]
    fn test_frame_alignment_aead_excludes_length() {
        // AEAD alignment covers only padlen + payload + padding.
        let packet = Packet::frame(vec![1; 13], 16, true);
        assert_eq!(packet.packet_length() % 16, 0);
    }

    #[test]
    fn test_round_trip() {
        let payload = b"Test SSH packet payload".to_vec();
        let packet = Packet::frame(payload.clone(), 8, false);
        let bytes = packet.to_bytes();

        let declared =
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, packet.packet_length());
        assert_eq!(Packet::extract_payload(&bytes[4..]).unwrap(), &payload[..]);
    }

    #[test]
    fn test_extract_payload_rejects_short_padding() {
        // padding_length 2 < minimum 4
        let body = [2u8, b'h', b'i', 0, 0];
        assert!(Packet::extract_payload(&body).is_err());
    }

    #[test]
    fn test_extract_payload_rejects_oversized_padding() {
        let body = [200u8, b'h', b'i'];
        assert!(Packet::extract_payload(&body).is_err());
    }

    #[test]
    fn test_extract_payload_empty_body() {
        assert!(Packet::extract_payload(&[]).is_err());
    }

    #[test]
    fn test_check_length_bounds() {
        assert!(Packet::check_length(12, 8, false).is_ok());
        // Too small to hold the padding_length field plus minimum padding.
        assert!(Packet::check_length(4, 8, false).is_err());
        // Above the receive bound.
        assert!(Packet::check_length(MAX_RECEIVE_LENGTH + 1, 8, false).is_err());
        // Misaligned for the block size.
        assert!(Packet::check_length(13, 8, false).is_err());
    }

    #[test]
    fn test_check_length_aead() {
        // 32 is a multiple of 16 without the length field.
        assert!(Packet::check_length(32, 16, true).is_ok());
        assert!(Packet::check_length(36, 16, true).is_err());
    }

    #[test]
    #[should_panic(expected = "Packet size")]
    fn test_frame_rejects_oversized_payload() {
        let _ = Packet::frame(vec![0u8; MAX_PACKET_SIZE + 1000], 8, false);
    }
}
