//! Wire primitives (RFC 4251 Section 5).
//!
//! Bounds-checked codecs for the SSH binary field encodings: `byte`,
//! `boolean`, `uint32`, length-prefixed `string`, `mpint`, and `name-list`.
//!
//! [`WireReader`] is an explicit cursor over a borrowed byte slice. Every read
//! reports truncation by returning [`None`] (the "need more data" sentinel)
//! instead of panicking; the owning transport treats a `None` as a malformed
//! packet and runs its recovery path. [`WireWriter`] mirrors the reader with an
//! infallible append API over an owned buffer — callers precompute each
//! message's length formula before writing.

/// Explicit cursor over a borrowed byte slice.
///
/// The cursor position advances as fields are consumed. Reads never panic:
/// a read that would exceed the remaining bytes (or a declared length that
/// overruns the buffer) returns [`None`] and leaves the cursor unchanged.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    /// Creates a reader positioned at byte `offset` within `buf`.
    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        WireReader {
            buf,
            pos: offset.min(buf.len()),
        }
    }

    /// Number of bytes remaining after the cursor.
    pub fn len(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Whether no bytes remain after the cursor.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Returns the remaining bytes and advances the cursor to the end.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        out
    }

    /// Reads exactly `n` raw bytes.
    pub fn take_raw(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    /// Reads a single `byte`.
    pub fn take_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    /// Reads a `uint32` (big-endian).
    pub fn take_u32(&mut self) -> Option<u32> {
        let bytes = self.take_raw(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a `boolean` (any non-zero byte is `true`).
    pub fn take_bool(&mut self) -> Option<bool> {
        Some(self.take_u8()? != 0)
    }

    /// Reads a length-prefixed `string` as raw bytes.
    pub fn take_string(&mut self) -> Option<&'a [u8]> {
        let len = self.take_u32()? as usize;
        match self.take_raw(len) {
            Some(bytes) => Some(bytes),
            None => {
                // Roll the cursor back past the length prefix so the reader is
                // left in the same need-more-data state as the other readers.
                self.pos -= 4;
                None
            }
        }
    }

    /// Reads a length-prefixed `string` and decodes it as UTF-8.
    pub fn take_utf8(&mut self) -> Option<String> {
        let start = self.pos;
        let bytes = self.take_string()?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Some(s.to_owned()),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// Reads an `mpint` and returns its raw (length-prefixed) value bytes.
    ///
    /// The bytes are the two's-complement big-endian magnitude exactly as sent;
    /// callers feed them to `BigUint::from_bytes_be`, which tolerates the
    /// optional leading sign byte.
    pub fn take_mpint(&mut self) -> Option<&'a [u8]> {
        self.take_string()
    }

    /// Reads a `name-list`: a length-prefixed, comma-separated ASCII string.
    ///
    /// An empty string yields an empty list (RFC 4251 Section 5).
    pub fn take_name_list(&mut self) -> Option<Vec<String>> {
        let bytes = self.take_string()?;
        let s = std::str::from_utf8(bytes).ok()?;
        if s.is_empty() {
            Some(Vec::new())
        } else {
            Some(s.split(',').map(|part| part.to_owned()).collect())
        }
    }
}

/// Append-only writer over an owned byte buffer.
///
/// Mirrors [`WireReader`] with an infallible API: callers size each message
/// with its own length formula before writing.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        WireWriter { buf: Vec::new() }
    }

    /// Creates an empty writer with room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        WireWriter {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends a single `byte`.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a `uint32` (big-endian).
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a `boolean` (encoded as `1` or `0`).
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(if value { 1 } else { 0 });
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_raw(&mut self, data: impl AsRef<[u8]>) {
        self.buf.extend_from_slice(data.as_ref());
    }

    /// Appends a length-prefixed `string`.
    pub fn put_string(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    /// Appends an `mpint` given the big-endian magnitude `value`.
    ///
    /// Leading zero bytes are stripped and a `0x00` sign byte is prepended when
    /// the high bit of the first byte is set, per RFC 4251 Section 5.
    pub fn put_mpint(&mut self, value: impl AsRef<[u8]>) {
        self.put_raw(encode_mpint(value.as_ref()));
    }

    /// Appends a `name-list` from a slice of names.
    pub fn put_name_list(&mut self, names: impl AsRef<[String]>) {
        self.put_string(names.as_ref().join(","));
    }

    /// Consumes the writer and returns the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Encodes a big-endian unsigned magnitude as a standalone SSH `mpint`.
///
/// Strips leading zero bytes, prepends a `0x00` sign byte when the most
/// significant bit is set, and prefixes the `uint32` length (RFC 4251
/// Section 5). A zero value encodes as a zero-length string.
pub fn encode_mpint(value: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start < value.len() && value[start] == 0 {
        start += 1;
    }
    let magnitude = &value[start..];

    if magnitude.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_sign_byte = magnitude[0] & 0x80 != 0;
    let len = magnitude.len() + if needs_sign_byte { 1 } else { 0 };

    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if needs_sign_byte {
        out.push(0);
    }
    out.extend_from_slice(magnitude);
    out
}
