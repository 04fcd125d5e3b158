//! SSH transport engine (RFC 4253).
//!
//! One [`Transport`] owns a byte stream and carries the full per-connection
//! packet state for both directions:
//!
//! - identification exchange (greeting capture, version validation, peer
//!   quirk detection)
//! - the framing/cipher/MAC/compression pipeline, classical and AEAD
//! - per-direction 32-bit sequence numbers, incremented on every packet
//!   (ignored ones included) and wrapping at 2^32
//! - the outgoing `INIT → READY ⇄ REKEYING` status with its rekey queues:
//!   outbound application traffic queues FIFO (unbounded) during a rekey,
//!   inbound non-transport packets queue up to a fixed cap and replay in
//!   arrival order afterwards
//! - key installation on NEWKEYS, resetting the per-direction byte counters
//! - the fatal-error path: best-effort DISCONNECT with a precise reason
//!   code, then a full state reset
//!
//! The key-exchange drivers in `client`/`server` feed derived key material
//! in via [`Transport::install_outgoing`] / [`Transport::install_incoming`];
//! the engine never does DH math itself.

use crate::ssh::compress::{CompressionAlgorithm, Compressor, Decompressor};
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm, MacKey, PacketCipher};
use crate::ssh::message::{allowed_during_kex, DisconnectReason, MessageType};
use crate::ssh::packet::{Packet, MAX_PACKET_SIZE, MAX_RECEIVE_LENGTH};
use crate::ssh::version::{take_identification_line, PeerQuirks, Version};
use crate::ssh::wire::{WireReader, WireWriter};
use skiff_platform::{DisconnectLevel, SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Cap on inbound non-transport packets buffered during a rekey.
pub const MAX_INBOUND_REKEY_QUEUE: usize = 32;

/// Cap on free-text greeting bytes accepted before the identification line.
const MAX_GREETING_BYTES: usize = 8 * 1024;

/// Which side of the connection this transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side.
    Client,
    /// Server side.
    Server,
}

/// Outgoing-direction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingStatus {
    /// Before the first key exchange completes.
    Init,
    /// Normal operation.
    Ready,
    /// A key exchange is in progress; application traffic queues.
    Rekeying,
}

/// Derived key material for one direction, as handed over by a kex driver.
#[derive(Debug)]
pub struct DirectionKeys {
    /// Negotiated cipher.
    pub cipher: CipherAlgorithm,
    /// Cipher key bytes.
    pub key: Vec<u8>,
    /// Cipher IV bytes.
    pub iv: Vec<u8>,
    /// Negotiated MAC (unused on the wire for AEAD ciphers).
    pub mac: MacAlgorithm,
    /// MAC key bytes.
    pub mac_key: Vec<u8>,
    /// Negotiated compression.
    pub compression: CompressionAlgorithm,
}

/// The SSH transport engine over a reliable byte stream.
pub struct Transport<S> {
    stream: S,
    role: Role,

    // Incoming direction.
    in_seq: u32,
    in_cipher: Option<PacketCipher>,
    in_mac: Option<MacKey>,
    in_compression: CompressionAlgorithm,
    in_decompressor: Option<Decompressor>,
    bytes_received: u64,
    ignore_next_packet: bool,
    inbound_rekey_queue: Vec<Vec<u8>>,
    last_recv_seq: u32,

    // Outgoing direction.
    status: OutgoingStatus,
    out_seq: u32,
    out_cipher: Option<PacketCipher>,
    out_mac: Option<MacKey>,
    out_compression: CompressionAlgorithm,
    out_compressor: Option<Compressor>,
    bytes_sent: u64,
    outbound_rekey_queue: std::collections::VecDeque<Vec<u8>>,

    // Session-wide.
    session_id: Option<Vec<u8>>,
    authenticated: bool,
    local_version: Version,
    peer_version: Option<Version>,
    peer_quirks: PeerQuirks,
    peer_greeting: String,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a byte stream. No bytes are exchanged until
    /// [`exchange_identification`](Self::exchange_identification).
    pub fn new(stream: S, role: Role, local_version: Version) -> Self {
        Self {
            stream,
            role,
            in_seq: 0,
            in_cipher: None,
            in_mac: None,
            in_compression: CompressionAlgorithm::None,
            in_decompressor: None,
            bytes_received: 0,
            ignore_next_packet: false,
            inbound_rekey_queue: Vec::new(),
            last_recv_seq: 0,
            status: OutgoingStatus::Init,
            out_seq: 0,
            out_cipher: None,
            out_mac: None,
            out_compression: CompressionAlgorithm::None,
            out_compressor: None,
            bytes_sent: 0,
            outbound_rekey_queue: std::collections::VecDeque::new(),
            session_id: None,
            authenticated: false,
            local_version,
            peer_version: None,
            peer_quirks: PeerQuirks::default(),
            peer_greeting: String::new(),
        }
    }

    /// Returns this transport's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the outgoing-direction status.
    pub fn status(&self) -> OutgoingStatus {
        self.status
    }

    /// Returns our identification line (no CR LF).
    pub fn local_version(&self) -> &Version {
        &self.local_version
    }

    /// Returns the peer's identification, once exchanged.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Returns the peer's recorded quirks.
    pub fn peer_quirks(&self) -> PeerQuirks {
        self.peer_quirks
    }

    /// Returns free-text greeting lines the peer sent before its
    /// identification.
    pub fn peer_greeting(&self) -> &str {
        &self.peer_greeting
    }

    /// Returns the session identifier (first exchange hash), once set.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Stores the session identifier. Only the first call takes effect: the
    /// session id never changes across rekeys.
    pub fn set_session_id(&mut self, id: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(id.to_vec());
        }
    }

    /// Returns bytes sent since the last NEWKEYS.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Returns bytes received since the last NEWKEYS.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Returns the sequence number of the most recently received packet
    /// (for UNIMPLEMENTED replies).
    pub fn last_recv_seq(&self) -> u32 {
        self.last_recv_seq
    }

    /// Arms the one-shot "ignore next packet" flag (kex guess mismatch).
    pub fn ignore_next_packet(&mut self) {
        self.ignore_next_packet = true;
    }

    /// Marks user authentication complete, activating delayed compression.
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
        if self.out_compression.is_delayed() && self.out_compressor.is_none() {
            self.out_compressor = Some(Compressor::new());
        }
        if self.in_compression.is_delayed() && self.in_decompressor.is_none() {
            self.in_decompressor = Some(Decompressor::new());
        }
    }

    // -- identification exchange --------------------------------------------

    /// Performs the identification exchange.
    ///
    /// The server may send free-text `greeting` lines first. The peer's own
    /// pre-identification lines are captured and exposed via
    /// [`peer_greeting`](Self::peer_greeting). The peer must declare
    /// protocol version 2.0 or 1.99.
    pub async fn exchange_identification(
        &mut self,
        greeting: Option<&str>,
    ) -> SkiffResult<&Version> {
        if let (Role::Server, Some(text)) = (self.role, greeting) {
            for line in text.lines() {
                self.stream.write_all(line.as_bytes()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
        }
        self.stream
            .write_all(&self.local_version.to_wire_format())
            .await?;
        self.stream.flush().await?;

        // Read lines until the identification line appears; everything
        // before it is greeting text with no protocol meaning.
        let mut consumed_greeting = 0usize;
        loop {
            let line = self.read_line().await?;
            if line.starts_with("SSH-") {
                let version = Version::parse(&line)?;
                self.peer_quirks = version.quirks();
                debug!(
                    software = version.software(),
                    quirks = ?self.peer_quirks,
                    "peer identified"
                );
                self.peer_version = Some(version);
                return Ok(self.peer_version.as_ref().expect("just set"));
            }
            consumed_greeting += line.len() + 1;
            if consumed_greeting > MAX_GREETING_BYTES {
                return Err(SkiffError::Protocol(
                    "Peer greeting exceeds limit without identification".to_string(),
                ));
            }
            if !self.peer_greeting.is_empty() {
                self.peer_greeting.push('\n');
            }
            self.peer_greeting.push_str(&line);
        }
    }

    async fn read_line(&mut self) -> SkiffResult<String> {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await?;
            buffer.push(byte[0]);
            if byte[0] == b'\n' {
                let (line, _) = take_identification_line(&buffer).expect("newline present");
                return Ok(line);
            }
            if buffer.len() > 255 {
                return Err(SkiffError::Protocol(
                    "Identification line too long".to_string(),
                ));
            }
        }
    }

    // -- key installation ---------------------------------------------------

    /// Installs keys for the outgoing direction (called when we send
    /// NEWKEYS). Resets the outgoing byte counter.
    pub fn install_outgoing(&mut self, keys: DirectionKeys) -> SkiffResult<()> {
        let cipher = PacketCipher::new(keys.cipher, &keys.key, &keys.iv)?;
        self.out_mac = if keys.cipher.is_aead() {
            None
        } else {
            Some(MacKey::new(keys.mac, &keys.mac_key)?)
        };
        self.out_cipher = Some(cipher);
        self.out_compression = keys.compression;
        self.out_compressor = if keys.compression.is_compressing()
            && (!keys.compression.is_delayed() || self.authenticated)
        {
            Some(Compressor::new())
        } else {
            None
        };
        self.bytes_sent = 0;
        Ok(())
    }

    /// Installs keys for the incoming direction (called when the peer's
    /// NEWKEYS arrives). Resets the incoming byte counter.
    pub fn install_incoming(&mut self, keys: DirectionKeys) -> SkiffResult<()> {
        let cipher = PacketCipher::new(keys.cipher, &keys.key, &keys.iv)?;
        self.in_mac = if keys.cipher.is_aead() {
            None
        } else {
            Some(MacKey::new(keys.mac, &keys.mac_key)?)
        };
        self.in_cipher = Some(cipher);
        self.in_compression = keys.compression;
        self.in_decompressor = if keys.compression.is_compressing()
            && (!keys.compression.is_delayed() || self.authenticated)
        {
            Some(Decompressor::new())
        } else {
            None
        };
        self.bytes_received = 0;
        Ok(())
    }

    // -- rekey status -------------------------------------------------------

    /// Enters the REKEYING state. Application traffic sent afterwards is
    /// queued until [`finish_rekey`](Self::finish_rekey).
    pub fn begin_rekey(&mut self) {
        debug!(status = ?self.status, "entering rekey");
        self.status = OutgoingStatus::Rekeying;
    }

    /// Completes a key exchange: status returns to READY and the deferred
    /// outbound traffic is flushed in original order.
    pub async fn finish_rekey(&mut self) -> SkiffResult<()> {
        self.status = OutgoingStatus::Ready;
        while let Some(payload) = self.outbound_rekey_queue.pop_front() {
            self.write_packet(&payload).await?;
        }
        debug!("rekey complete, deferred traffic flushed");
        Ok(())
    }

    /// Buffers an inbound non-transport packet that arrived mid-rekey.
    ///
    /// # Errors
    ///
    /// Exceeding [`MAX_INBOUND_REKEY_QUEUE`] is a protocol error.
    pub fn queue_inbound(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        if self.inbound_rekey_queue.len() >= MAX_INBOUND_REKEY_QUEUE {
            return Err(SkiffError::Protocol(format!(
                "More than {} packets buffered during rekey",
                MAX_INBOUND_REKEY_QUEUE
            )));
        }
        self.inbound_rekey_queue.push(payload);
        Ok(())
    }

    /// Takes the packets buffered during the rekey, in arrival order.
    pub fn take_inbound_queue(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inbound_rekey_queue)
    }

    // -- sending ------------------------------------------------------------

    /// Sends one payload, or queues it when a rekey is in flight and the
    /// payload is not a transport/kex message.
    pub async fn send_payload(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let msg_type = *payload.first().ok_or_else(|| {
            SkiffError::Protocol("Refusing to send an empty payload".to_string())
        })?;

        if self.status == OutgoingStatus::Rekeying && !allowed_during_kex(msg_type) {
            trace!(msg_type, "deferring payload during rekey");
            self.outbound_rekey_queue.push_back(payload.to_vec());
            return Ok(());
        }

        self.write_packet(payload).await
    }

    async fn write_packet(&mut self, payload: &[u8]) -> SkiffResult<()> {
        if payload.len() > MAX_PACKET_SIZE - 1024 {
            return Err(SkiffError::Protocol(format!(
                "Payload of {} bytes exceeds packet bound",
                payload.len()
            )));
        }

        let payload = match &mut self.out_compressor {
            Some(compressor) => compressor.compress(payload)?,
            None => payload.to_vec(),
        };

        let (block_size, aead) = match &self.out_cipher {
            Some(cipher) => (cipher.algorithm().block_size(), cipher.algorithm().is_aead()),
            None => (8, false),
        };

        let packet = Packet::frame(payload, block_size, aead);
        let framed = packet.to_bytes();

        let wire = match (&mut self.out_cipher, &self.out_mac) {
            (None, _) => framed,
            (Some(cipher), _) if aead => {
                let (aad, body) = framed.split_at(4);
                let sealed = cipher.seal(aad, body)?;
                let mut wire = Vec::with_capacity(4 + sealed.len());
                wire.extend_from_slice(aad);
                wire.extend_from_slice(&sealed);
                wire
            }
            (Some(cipher), mac) => {
                let tag = mac
                    .as_ref()
                    .map(|m| m.compute(self.out_seq, &framed))
                    .unwrap_or_default();
                let mut wire = framed;
                cipher.apply_keystream(&mut wire)?;
                wire.extend_from_slice(&tag);
                wire
            }
        };

        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;

        self.out_seq = self.out_seq.wrapping_add(1);
        self.bytes_sent += wire.len() as u64;
        Ok(())
    }

    // -- receiving ----------------------------------------------------------

    /// Reads the next meaningful payload.
    ///
    /// Transparently consumes IGNORE and DEBUG messages, honors the
    /// one-shot ignore flag, and turns a peer DISCONNECT into an error.
    pub async fn next_payload(&mut self) -> SkiffResult<Vec<u8>> {
        loop {
            let payload = match self.read_packet().await {
                Ok(payload) => payload,
                Err(e) => {
                    // Unrecoverable parse failure: the connection state is
                    // undefined past this point.
                    self.reset();
                    return Err(e);
                }
            };

            if self.ignore_next_packet {
                self.ignore_next_packet = false;
                trace!("discarded one packet after kex guess mismatch");
                continue;
            }

            match payload.first().copied() {
                Some(t) if t == MessageType::Ignore as u8 => continue,
                Some(t) if t == MessageType::Debug as u8 => {
                    let mut r = WireReader::at(&payload, 1);
                    let _always_display = r.take_bool();
                    if let Some(message) = r.take_utf8() {
                        debug!(%message, "peer debug message");
                    }
                    continue;
                }
                Some(t) if t == MessageType::Disconnect as u8 => {
                    let mut r = WireReader::at(&payload, 1);
                    let code = r.take_u32().unwrap_or(0);
                    let message = r.take_utf8().unwrap_or_default();
                    warn!(code, %message, "peer disconnected");
                    self.reset();
                    return Err(SkiffError::Disconnect {
                        code,
                        level: DisconnectLevel::Protocol,
                        message: format!("Peer disconnected: {}", message),
                    });
                }
                Some(_) => return Ok(payload),
                None => {
                    return Err(SkiffError::Protocol("Empty packet payload".to_string()))
                }
            }
        }
    }

    async fn read_packet(&mut self) -> SkiffResult<Vec<u8>> {
        let (aead, block_size, tag_size) = match &self.in_cipher {
            Some(cipher) => (
                cipher.algorithm().is_aead(),
                cipher.algorithm().block_size(),
                cipher.algorithm().tag_size(),
            ),
            None => (false, 8, 0),
        };

        let body = if self.in_cipher.is_none() {
            // Plaintext phase.
            let mut len_bytes = [0u8; 4];
            self.stream.read_exact(&mut len_bytes).await?;
            let packet_length = u32::from_be_bytes(len_bytes) as usize;
            Packet::check_length(packet_length, block_size, false)?;

            let mut body = vec![0u8; packet_length];
            self.stream.read_exact(&mut body).await?;
            self.bytes_received += (4 + packet_length) as u64;
            body
        } else if aead {
            // The length field travels as authenticated-but-unencrypted
            // associated data.
            let mut len_bytes = [0u8; 4];
            self.stream.read_exact(&mut len_bytes).await?;
            let packet_length = u32::from_be_bytes(len_bytes) as usize;
            Packet::check_length(packet_length, block_size, true)?;

            let mut sealed = vec![0u8; packet_length + tag_size];
            self.stream.read_exact(&mut sealed).await?;
            let cipher = self.in_cipher.as_mut().expect("aead cipher present");
            let body = cipher.open(&len_bytes, &sealed)?;
            self.bytes_received += (4 + sealed.len()) as u64;
            body
        } else {
            // Classical cipher: decrypt the first block to learn the length.
            let mac_size = self
                .in_mac
                .as_ref()
                .map(|m| m.algorithm().tag_size())
                .unwrap_or(0);

            let mut first_block = vec![0u8; block_size];
            self.stream.read_exact(&mut first_block).await?;
            let cipher = self.in_cipher.as_mut().expect("cipher present");
            cipher.apply_keystream(&mut first_block)?;

            let packet_length =
                u32::from_be_bytes([first_block[0], first_block[1], first_block[2], first_block[3]])
                    as usize;
            Packet::check_length(packet_length, block_size, false)?;

            let remaining = 4 + packet_length - block_size;
            let mut rest = vec![0u8; remaining];
            self.stream.read_exact(&mut rest).await?;
            let cipher = self.in_cipher.as_mut().expect("cipher present");
            cipher.apply_keystream(&mut rest)?;

            let mut plaintext = first_block;
            plaintext.extend_from_slice(&rest);

            if mac_size > 0 {
                let mut tag = vec![0u8; mac_size];
                self.stream.read_exact(&mut tag).await?;
                let mac = self.in_mac.as_ref().expect("mac present");
                mac.verify(self.in_seq, &plaintext, &tag)?;
            }

            self.bytes_received += (plaintext.len() + mac_size) as u64;
            plaintext.drain(..4);
            plaintext
        };

        self.last_recv_seq = self.in_seq;
        self.in_seq = self.in_seq.wrapping_add(1);

        if packet_too_large(&body) {
            return Err(SkiffError::Protocol("Bad packet length".to_string()));
        }

        let payload = Packet::extract_payload(&body)?.to_vec();

        match &mut self.in_decompressor {
            Some(decompressor) => decompressor.decompress(&payload, MAX_RECEIVE_LENGTH),
            None => Ok(payload),
        }
    }

    // -- fatal path ---------------------------------------------------------

    /// Sends a best-effort DISCONNECT with the given reason, resets all
    /// transport state, and returns the error to propagate.
    pub async fn disconnect_with(
        &mut self,
        reason: DisconnectReason,
        level: DisconnectLevel,
        message: &str,
    ) -> SkiffError {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::Disconnect as u8);
        w.put_u32(reason as u32);
        w.put_string(message.as_bytes());
        w.put_string(b"");
        let payload = w.into_bytes();

        // Best effort only: the peer may already be gone.
        if let Err(e) = self.write_packet(&payload).await {
            debug!(error = %e, "DISCONNECT could not be delivered");
        }

        self.reset();
        SkiffError::Disconnect {
            code: reason as u32,
            level,
            message: message.to_string(),
        }
    }

    /// Sends a graceful DISCONNECT(BY_APPLICATION) without an error.
    pub async fn close(&mut self) -> SkiffResult<()> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::Disconnect as u8);
        w.put_u32(DisconnectReason::ByApplication as u32);
        w.put_string(b"closed by application");
        w.put_string(b"");
        let payload = w.into_bytes();
        let result = self.write_packet(&payload).await;
        self.reset();
        result
    }

    /// Drops all cryptographic state, queues and partial buffers. The
    /// transport is unusable afterwards; the connection must be abandoned.
    pub fn reset(&mut self) {
        self.in_cipher = None;
        self.in_mac = None;
        self.in_decompressor = None;
        self.out_cipher = None;
        self.out_mac = None;
        self.out_compressor = None;
        self.outbound_rekey_queue.clear();
        self.inbound_rekey_queue.clear();
        self.ignore_next_packet = false;
        self.status = OutgoingStatus::Init;
    }

    /// Builds an UNIMPLEMENTED reply for the given received sequence number.
    pub fn unimplemented_payload(sequence: u32) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(5);
        w.put_u8(MessageType::Unimplemented as u8);
        w.put_u32(sequence);
        w.into_bytes()
    }
}

fn packet_too_large(body: &[u8]) -> bool {
    // body excludes the 4-byte length field.
    4 + body.len() > MAX_RECEIVE_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::kex_dh::{derive_key, KexHash};
    use tokio::io::duplex;

    fn version() -> Version {
        Version::new("Skiff_test", None)
    }

    fn test_keys(cipher: CipherAlgorithm, letter_base: u8) -> DirectionKeys {
        let k = vec![0x42; 32];
        let h = vec![0x24; 32];
        DirectionKeys {
            cipher,
            key: derive_key(KexHash::Sha256, &k, &h, &h, letter_base + 2, cipher.key_size()),
            iv: derive_key(KexHash::Sha256, &k, &h, &h, letter_base, cipher.iv_size()),
            mac: MacAlgorithm::HmacSha256,
            mac_key: derive_key(KexHash::Sha256, &k, &h, &h, letter_base + 4, 32),
            compression: CompressionAlgorithm::None,
        }
    }

    #[tokio::test]
    async fn test_identification_exchange_with_greeting() {
        let (client_stream, server_stream) = duplex(4096);
        let mut client = Transport::new(client_stream, Role::Client, version());
        let mut server = Transport::new(server_stream, Role::Server, version());

        let (client_result, server_result) = tokio::join!(
            client.exchange_identification(None),
            server.exchange_identification(Some("Welcome to the test server\nSecond line")),
        );
        client_result.unwrap();
        server_result.unwrap();

        assert_eq!(
            client.peer_greeting(),
            "Welcome to the test server\nSecond line"
        );
        assert_eq!(client.peer_version().unwrap().software(), "Skiff_test");
        assert_eq!(server.peer_version().unwrap().software(), "Skiff_test");
    }

    #[tokio::test]
    async fn test_plaintext_packet_round_trip() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.send_payload(&[21]).await.unwrap();
        let payload = rx.next_payload().await.unwrap();
        assert_eq!(payload, vec![21]);
        assert_eq!(tx.out_seq, 1);
        assert_eq!(rx.in_seq, 1);
    }

    #[tokio::test]
    async fn test_sequence_number_wraparound() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.out_seq = u32::MAX - 1;
        rx.in_seq = u32::MAX - 1;

        tx.send_payload(&[21]).await.unwrap();
        assert_eq!(tx.out_seq, u32::MAX);
        tx.send_payload(&[21]).await.unwrap();
        assert_eq!(tx.out_seq, 0);

        rx.next_payload().await.unwrap();
        rx.next_payload().await.unwrap();
        assert_eq!(rx.in_seq, 0);
    }

    #[tokio::test]
    async fn test_ignore_and_debug_are_transparent() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        // IGNORE with a payload string.
        let mut w = WireWriter::new();
        w.put_u8(MessageType::Ignore as u8);
        w.put_string(b"noise");
        tx.send_payload(&w.into_bytes()).await.unwrap();

        // DEBUG.
        let mut w = WireWriter::new();
        w.put_u8(MessageType::Debug as u8);
        w.put_bool(false);
        w.put_string(b"debugging");
        w.put_string(b"");
        tx.send_payload(&w.into_bytes()).await.unwrap();

        tx.send_payload(&[21]).await.unwrap();

        // Only the NEWKEYS surfaces; the sequence number counted all three.
        let payload = rx.next_payload().await.unwrap();
        assert_eq!(payload, vec![21]);
        assert_eq!(rx.in_seq, 3);
    }

    #[tokio::test]
    async fn test_one_shot_ignore_flag() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        rx.ignore_next_packet();
        tx.send_payload(&[30, 1, 2, 3]).await.unwrap(); // the bad guess
        tx.send_payload(&[21]).await.unwrap();

        let payload = rx.next_payload().await.unwrap();
        assert_eq!(payload, vec![21]);
        // Both packets consumed sequence numbers.
        assert_eq!(rx.in_seq, 2);
    }

    #[tokio::test]
    async fn test_ctr_hmac_round_trip() {
        let (a, b) = duplex(16384);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.install_outgoing(test_keys(CipherAlgorithm::Aes256Ctr, b'A'))
            .unwrap();
        rx.install_incoming(test_keys(CipherAlgorithm::Aes256Ctr, b'A'))
            .unwrap();

        for i in 0..5u8 {
            let payload = vec![94, 0, 0, 0, i];
            tx.send_payload(&payload).await.unwrap();
            assert_eq!(rx.next_payload().await.unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_gcm_round_trip() {
        let (a, b) = duplex(16384);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.install_outgoing(test_keys(CipherAlgorithm::Aes128Gcm, b'A'))
            .unwrap();
        rx.install_incoming(test_keys(CipherAlgorithm::Aes128Gcm, b'A'))
            .unwrap();

        for i in 0..5u8 {
            let payload = vec![94, 0, 0, 0, i, i, i];
            tx.send_payload(&payload).await.unwrap();
            assert_eq!(rx.next_payload().await.unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn test_mac_mismatch_resets() {
        let (a, b) = duplex(16384);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.install_outgoing(test_keys(CipherAlgorithm::Aes256Ctr, b'A'))
            .unwrap();
        // Receiver derives a different MAC key.
        let mut keys = test_keys(CipherAlgorithm::Aes256Ctr, b'A');
        keys.mac_key = vec![0xee; 32];
        rx.install_incoming(keys).unwrap();

        tx.send_payload(&[94, 1, 2, 3]).await.unwrap();
        assert!(rx.next_payload().await.is_err());
        // The failed transport dropped its keys.
        assert!(rx.in_cipher.is_none());
    }

    #[tokio::test]
    async fn test_compression_round_trip() {
        let (a, b) = duplex(16384);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        let mut out = test_keys(CipherAlgorithm::Aes256Ctr, b'A');
        out.compression = CompressionAlgorithm::Zlib;
        let mut inn = test_keys(CipherAlgorithm::Aes256Ctr, b'A');
        inn.compression = CompressionAlgorithm::Zlib;

        tx.install_outgoing(out).unwrap();
        rx.install_incoming(inn).unwrap();

        let mut payload = vec![94];
        payload.extend(std::iter::repeat(b'x').take(4000));
        tx.send_payload(&payload).await.unwrap();
        assert_eq!(rx.next_payload().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_delayed_compression_waits_for_auth() {
        let (a, _b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());

        let mut keys = test_keys(CipherAlgorithm::Aes256Ctr, b'A');
        keys.compression = CompressionAlgorithm::ZlibDelayed;
        tx.install_outgoing(keys).unwrap();
        assert!(tx.out_compressor.is_none());

        tx.mark_authenticated();
        assert!(tx.out_compressor.is_some());
    }

    #[tokio::test]
    async fn test_rekey_defers_and_flushes_in_order() {
        let (a, b) = duplex(65536);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.begin_rekey();

        // Application traffic queues; kex traffic passes.
        for i in 0..5u8 {
            tx.send_payload(&[94, 0, 0, 0, i]).await.unwrap();
        }
        assert_eq!(tx.outbound_rekey_queue.len(), 5);
        tx.send_payload(&[21]).await.unwrap(); // NEWKEYS passes through

        tx.finish_rekey().await.unwrap();
        assert!(tx.outbound_rekey_queue.is_empty());

        // Receiver sees NEWKEYS first, then the five data packets in order.
        assert_eq!(rx.next_payload().await.unwrap(), vec![21]);
        for i in 0..5u8 {
            assert_eq!(rx.next_payload().await.unwrap(), vec![94, 0, 0, 0, i]);
        }
    }

    #[tokio::test]
    async fn test_inbound_rekey_queue_cap() {
        let (a, _b) = duplex(4096);
        let mut t = Transport::new(a, Role::Client, version());

        for _ in 0..MAX_INBOUND_REKEY_QUEUE {
            t.queue_inbound(vec![94]).unwrap();
        }
        assert!(t.queue_inbound(vec![94]).is_err());
    }

    #[tokio::test]
    async fn test_session_id_set_once() {
        let (a, _b) = duplex(64);
        let mut t = Transport::new(a, Role::Client, version());
        t.set_session_id(b"first");
        t.set_session_id(b"second");
        assert_eq!(t.session_id(), Some(&b"first"[..]));
    }

    #[tokio::test]
    async fn test_byte_counters_reset_on_key_install() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        tx.send_payload(&[21]).await.unwrap();
        rx.next_payload().await.unwrap();
        assert!(tx.bytes_sent() > 0);
        assert!(rx.bytes_received() > 0);

        tx.install_outgoing(test_keys(CipherAlgorithm::Aes256Ctr, b'A'))
            .unwrap();
        rx.install_incoming(test_keys(CipherAlgorithm::Aes256Ctr, b'A'))
            .unwrap();
        assert_eq!(tx.bytes_sent(), 0);
        assert_eq!(rx.bytes_received(), 0);
    }

    #[tokio::test]
    async fn test_bad_packet_length_rejected() {
        let (a, b) = duplex(4096);
        let mut raw = a;
        let mut rx = Transport::new(b, Role::Server, version());

        // Misaligned length (13 is not a multiple of 8).
        raw.write_all(&13u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0u8; 13]).await.unwrap();
        assert!(rx.next_payload().await.is_err());
    }

    #[tokio::test]
    async fn test_peer_disconnect_surfaces_reason() {
        let (a, b) = duplex(4096);
        let mut tx = Transport::new(a, Role::Client, version());
        let mut rx = Transport::new(b, Role::Server, version());

        let err = tx
            .disconnect_with(
                DisconnectReason::ProtocolError,
                DisconnectLevel::Protocol,
                "boom",
            )
            .await;
        assert!(matches!(err, SkiffError::Disconnect { code: 2, .. }));

        match rx.next_payload().await {
            Err(SkiffError::Disconnect { code, message, .. }) => {
                assert_eq!(code, 2);
                assert!(message.contains("boom"));
            }
            other => panic!("expected disconnect, got {:?}", other.map(|_| ())),
        }
    }
}
