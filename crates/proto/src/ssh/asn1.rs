//! Minimal DER reader/writer for the key codec.
//!
//! Only the handful of shapes SSH key material needs: SEQUENCE, INTEGER,
//! OCTET STRING, BIT STRING, OBJECT IDENTIFIER and context-specific
//! constructed tags. Used for PKCS#1 RSA keys, OpenSSL DSA keys, SEC1 EC
//! keys, and the DER ↔ SSH signature conversions for DSS and ECDSA.

use skiff_platform::{SkiffError, SkiffResult};

/// ASN.1 SEQUENCE tag (constructed).
pub const TAG_SEQUENCE: u8 = 0x30;
/// ASN.1 INTEGER tag.
pub const TAG_INTEGER: u8 = 0x02;
/// ASN.1 OCTET STRING tag.
pub const TAG_OCTET_STRING: u8 = 0x04;
/// ASN.1 BIT STRING tag.
pub const TAG_BIT_STRING: u8 = 0x03;
/// ASN.1 OBJECT IDENTIFIER tag.
pub const TAG_OID: u8 = 0x06;

fn truncated() -> SkiffError {
    SkiffError::Protocol("Truncated DER structure".to_string())
}

/// Cursor-based DER reader.
#[derive(Debug, Clone)]
pub struct DerReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DerReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns true when all bytes are consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize) -> SkiffResult<&'a [u8]> {
        if self.data.len() - self.offset < len {
            return Err(truncated());
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Reads a tag-length header and returns `(tag, content)`.
    pub fn read_tlv(&mut self) -> SkiffResult<(u8, &'a [u8])> {
        let tag = self.take(1)?[0];
        let first = self.take(1)?[0];
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                return Err(SkiffError::Protocol(format!(
                    "Unsupported DER length encoding: {} length bytes",
                    n
                )));
            }
            let mut len = 0usize;
            for &b in self.take(n)? {
                len = (len << 8) | b as usize;
            }
            len
        };
        Ok((tag, self.take(len)?))
    }

    /// Reads a TLV and checks its tag.
    pub fn expect(&mut self, tag: u8) -> SkiffResult<&'a [u8]> {
        let (got, content) = self.read_tlv()?;
        if got != tag {
            return Err(SkiffError::Protocol(format!(
                "Unexpected DER tag: expected 0x{:02x}, got 0x{:02x}",
                tag, got
            )));
        }
        Ok(content)
    }

    /// Enters a SEQUENCE and returns a reader over its content.
    pub fn sequence(&mut self) -> SkiffResult<DerReader<'a>> {
        Ok(DerReader::new(self.expect(TAG_SEQUENCE)?))
    }

    /// Reads an INTEGER and returns its magnitude with any leading sign
    /// byte stripped.
    pub fn integer(&mut self) -> SkiffResult<&'a [u8]> {
        let mut content = self.expect(TAG_INTEGER)?;
        while content.len() > 1 && content[0] == 0 {
            content = &content[1..];
        }
        Ok(content)
    }

    /// Reads an OCTET STRING.
    pub fn octet_string(&mut self) -> SkiffResult<&'a [u8]> {
        self.expect(TAG_OCTET_STRING)
    }

    /// Reads a BIT STRING, dropping the unused-bits byte.
    pub fn bit_string(&mut self) -> SkiffResult<&'a [u8]> {
        let content = self.expect(TAG_BIT_STRING)?;
        content
            .split_first()
            .map(|(_, rest)| rest)
            .ok_or_else(truncated)
    }

    /// Reads a context-specific constructed element `[n]` if it is next;
    /// returns `None` when the next tag differs or input is exhausted.
    pub fn optional_context(&mut self, n: u8) -> SkiffResult<Option<DerReader<'a>>> {
        let tag = 0xa0 | n;
        if self.data.get(self.offset) != Some(&tag) {
            return Ok(None);
        }
        Ok(Some(DerReader::new(self.expect(tag)?)))
    }
}

/// DER writer.
#[derive(Debug, Default)]
pub struct DerWriter {
    buf: Vec<u8>,
}

impl DerWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn write_tlv(&mut self, tag: u8, content: &[u8]) {
        self.buf.push(tag);
        let len = content.len();
        if len < 0x80 {
            self.buf.push(len as u8);
        } else {
            let bytes = len.to_be_bytes();
            let skip = bytes.iter().take_while(|&&b| b == 0).count();
            let significant = &bytes[skip..];
            self.buf.push(0x80 | significant.len() as u8);
            self.buf.extend_from_slice(significant);
        }
        self.buf.extend_from_slice(content);
    }

    /// Writes an INTEGER from an unsigned magnitude, adding the sign byte
    /// when the high bit is set.
    pub fn integer(&mut self, magnitude: &[u8]) {
        let mut m = magnitude;
        while m.len() > 1 && m[0] == 0 {
            m = &m[1..];
        }
        if m.is_empty() {
            self.write_tlv(TAG_INTEGER, &[0]);
        } else if m[0] & 0x80 != 0 {
            let mut content = Vec::with_capacity(m.len() + 1);
            content.push(0);
            content.extend_from_slice(m);
            self.write_tlv(TAG_INTEGER, &content);
        } else {
            self.write_tlv(TAG_INTEGER, m);
        }
    }

    /// Writes an OCTET STRING.
    pub fn octet_string(&mut self, content: &[u8]) {
        self.write_tlv(TAG_OCTET_STRING, content);
    }

    /// Writes a BIT STRING with zero unused bits.
    pub fn bit_string(&mut self, content: &[u8]) {
        let mut body = Vec::with_capacity(content.len() + 1);
        body.push(0);
        body.extend_from_slice(content);
        self.write_tlv(TAG_BIT_STRING, &body);
    }

    /// Writes an OBJECT IDENTIFIER from its encoded bytes.
    pub fn oid(&mut self, encoded: &[u8]) {
        self.write_tlv(TAG_OID, encoded);
    }

    /// Writes a SEQUENCE wrapping the output of `f`.
    pub fn sequence(&mut self, f: impl FnOnce(&mut DerWriter)) {
        let mut inner = DerWriter::new();
        f(&mut inner);
        self.write_tlv(TAG_SEQUENCE, &inner.buf);
    }

    /// Writes a context-specific constructed element `[n]` wrapping the
    /// output of `f`.
    pub fn context(&mut self, n: u8, f: impl FnOnce(&mut DerWriter)) {
        let mut inner = DerWriter::new();
        f(&mut inner);
        self.write_tlv(0xa0 | n, &inner.buf);
    }

    /// Consumes the writer and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_round_trip() {
        let mut w = DerWriter::new();
        w.integer(&[0x12, 0x34]);
        w.integer(&[0x80]); // needs sign byte
        w.integer(&[]); // zero
        let bytes = w.into_bytes();

        let mut r = DerReader::new(&bytes);
        assert_eq!(r.integer().unwrap(), &[0x12, 0x34]);
        assert_eq!(r.integer().unwrap(), &[0x80]);
        assert_eq!(r.integer().unwrap(), &[0x00]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_sequence_nesting() {
        let mut w = DerWriter::new();
        w.sequence(|w| {
            w.integer(&[1]);
            w.octet_string(b"abc");
        });
        let bytes = w.into_bytes();

        let mut outer = DerReader::new(&bytes);
        let mut seq = outer.sequence().unwrap();
        assert_eq!(seq.integer().unwrap(), &[1]);
        assert_eq!(seq.octet_string().unwrap(), b"abc");
        assert!(seq.is_empty());
    }

    #[test]
    fn test_long_form_length() {
        let content = vec![0x55u8; 300];
        let mut w = DerWriter::new();
        w.octet_string(&content);
        let bytes = w.into_bytes();
        // 0x04, 0x82, 0x01, 0x2c
        assert_eq!(&bytes[..4], &[0x04, 0x82, 0x01, 0x2c]);

        let mut r = DerReader::new(&bytes);
        assert_eq!(r.octet_string().unwrap(), &content[..]);
    }

    #[test]
    fn test_bit_string_round_trip() {
        let mut w = DerWriter::new();
        w.bit_string(&[0x04, 0xaa, 0xbb]);
        let bytes = w.into_bytes();
        let mut r = DerReader::new(&bytes);
        assert_eq!(r.bit_string().unwrap(), &[0x04, 0xaa, 0xbb]);
    }

    #[test]
    fn test_context_tag() {
        let mut w = DerWriter::new();
        w.sequence(|w| {
            w.integer(&[7]);
            w.context(1, |w| w.bit_string(&[0xff]));
        });
        let bytes = w.into_bytes();

        let mut outer = DerReader::new(&bytes);
        let mut seq = outer.sequence().unwrap();
        assert_eq!(seq.integer().unwrap(), &[7]);
        assert!(seq.optional_context(0).unwrap().is_none());
        let mut ctx = seq.optional_context(1).unwrap().unwrap();
        assert_eq!(ctx.bit_string().unwrap(), &[0xff]);
    }

    #[test]
    fn test_truncated_input() {
        // Header claims 10 bytes, only 2 present.
        let bytes = [0x02, 0x0a, 0x01, 0x02];
        let mut r = DerReader::new(&bytes);
        assert!(r.integer().is_err());
    }

    #[test]
    fn test_unexpected_tag() {
        let mut w = DerWriter::new();
        w.integer(&[1]);
        let bytes = w.into_bytes();
        let mut r = DerReader::new(&bytes);
        assert!(r.octet_string().is_err());
    }
}
