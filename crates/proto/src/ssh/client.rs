//! SSH client: connection driver, key exchange (including group exchange),
//! authentication methods and channel operations.
//!
//! # Host key verification
//!
//! Verification is an explicit asynchronous checkpoint. After the server's
//! signature over the exchange hash checks out, the configured
//! [`HostKeyVerifier`] receives the key's algorithm, blob and `SHA256:`
//! fingerprint and may resolve on a later tick. The engine tracks an
//! explicit awaiting/verified state so a NEWKEYS that lands before the
//! verdict is buffered and completed afterwards; rejection is a fatal
//! "host fingerprint verification failed" disconnect.

use crate::ssh::auth::{
    AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoRequest, InfoResponse,
    PendingMethods,
};
use crate::ssh::channel::ChannelTable;
use crate::ssh::connection::{
    channel_id_message, ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust, GlobalRequest,
    GlobalRequestType, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
use crate::ssh::hostkey::{fingerprint, verify_signature, HostKey};
use crate::ssh::kex::{
    guess_mismatched, negotiate, AlgorithmPreferences, KexInit, KexMethod, NewKeys,
};
use crate::ssh::kex_dh::{
    compute_exchange_hash, derive_transport_keys, DhExchange, EcdhExchange, ExchangeHashInputs,
    GexHashParams, KexHash, GEX_MAX_BITS, GEX_MIN_BITS, GEX_PREFERRED_BITS,
};
use crate::ssh::keyfile::KeyMaterial;
use crate::ssh::message::{
    allowed_during_kex, auth_msg, kex_msg, DisconnectReason, MessageType,
};
use crate::ssh::session::KEEPALIVE_REQUEST;
use crate::ssh::transport::{Role, Transport};
use crate::ssh::version::Version;
use crate::ssh::wire::{WireReader, WireWriter};
use skiff_platform::{DisconnectLevel, SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Everything a host-key verifier gets to look at.
#[derive(Debug, Clone)]
pub struct HostKeyInfo {
    /// Host key algorithm name.
    pub algorithm: String,
    /// SSH wire public key blob.
    pub public_key_blob: Vec<u8>,
    /// `SHA256:` base64 fingerprint of the blob.
    pub fingerprint: String,
}

/// Asynchronous host-key verification callback. May resolve immediately or
/// on a later tick; returning false aborts the handshake.
pub type HostKeyVerifier =
    Arc<dyn Fn(HostKeyInfo) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Software banner suffix for the identification line.
    pub ident: String,
    /// Ordered algorithm preference overrides.
    pub algorithms: AlgorithmPreferences,
    /// Maximum channel packet size we advertise.
    pub max_packet_size: u32,
    /// Receive budget per channel (the window we grant the server).
    pub high_water_mark: u32,
    /// Host key verification checkpoint; `None` accepts any host key.
    pub host_key_verifier: Option<HostKeyVerifier>,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            ident: format!("Skiff_{}", env!("CARGO_PKG_VERSION")),
            algorithms: AlgorithmPreferences::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            high_water_mark: DEFAULT_WINDOW_SIZE,
            host_key_verifier: None,
        }
    }
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("ident", &self.ident)
            .field("algorithms", &self.algorithms)
            .field("max_packet_size", &self.max_packet_size)
            .field("high_water_mark", &self.high_water_mark)
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authentication complete; the connection is ready.
    Success,
    /// The attempt failed.
    Failure {
        /// Methods that can productively continue.
        methods: Vec<String>,
        /// True when this method succeeded but more are required.
        partial: bool,
    },
    /// The server requires a password change before continuing.
    ChangeRequired(String),
}

/// An SSH client connection.
pub struct SshClient<S> {
    transport: Transport<S>,
    config: SshClientConfig,
    channels: ChannelTable,
    pending_methods: PendingMethods,
    pending_inbound: VecDeque<Vec<u8>>,
    authenticated: bool,
    username: Option<String>,
    server_host_key: Option<Vec<u8>>,
    banner: Option<String>,
    /// Key staged by an in-flight public-key attempt, used to sign once
    /// the server answers PK_OK.
    signing_key: Option<Box<dyn HostKey>>,
}

impl SshClient<TcpStream> {
    /// Connects over TCP and completes the handshake.
    pub async fn connect(addr: &str, config: SshClientConfig) -> SkiffResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self::from_stream(stream, config)?;
        client.handshake().await?;
        Ok(client)
    }
}

impl<S> SshClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a byte stream. Call [`handshake`](Self::handshake) next.
    pub fn from_stream(stream: S, config: SshClientConfig) -> SkiffResult<Self> {
        config.algorithms.validate(false)?;
        let version = Version::new(&config.ident, None);
        Ok(Self {
            transport: Transport::new(stream, Role::Client, version),
            config,
            channels: ChannelTable::new(),
            pending_methods: PendingMethods::new(),
            pending_inbound: VecDeque::new(),
            authenticated: false,
            username: None,
            server_host_key: None,
            banner: None,
            signing_key: None,
        })
    }

    /// Returns the authenticated username.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns whether authentication completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns the server's host key blob, once the handshake completed.
    pub fn server_host_key(&self) -> Option<&[u8]> {
        self.server_host_key.as_deref()
    }

    /// Returns the server host key fingerprint.
    pub fn server_fingerprint(&self) -> Option<String> {
        self.server_host_key.as_deref().map(fingerprint)
    }

    /// Returns the userauth banner, if the server sent one.
    pub fn auth_banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Returns the session identifier, once the first key exchange
    /// completed.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.transport.session_id()
    }

    /// Returns the server's pre-identification greeting text.
    pub fn server_greeting(&self) -> &str {
        self.transport.peer_greeting()
    }

    async fn next_message(&mut self) -> SkiffResult<Vec<u8>> {
        if let Some(payload) = self.pending_inbound.pop_front() {
            return Ok(payload);
        }
        self.transport.next_payload().await
    }

    // -- handshake ----------------------------------------------------------

    /// Performs the identification exchange and the first key exchange.
    pub async fn handshake(&mut self) -> SkiffResult<()> {
        self.transport.exchange_identification(None).await?;
        self.key_exchange(None).await
    }

    /// Initiates a rekey. The deferred-traffic semantics are handled by the
    /// transport: anything sent while the exchange runs is queued and
    /// flushed in order afterwards.
    pub async fn request_rekey(&mut self) -> SkiffResult<()> {
        self.key_exchange(None).await
    }

    async fn key_exchange(&mut self, peer_kexinit: Option<Vec<u8>>) -> SkiffResult<()> {
        let mut our_kexinit = KexInit::new_default();
        self.config.algorithms.apply(&mut our_kexinit);
        if self.transport.peer_quirks().no_group_exchange {
            our_kexinit.strip_group_exchange();
        }
        let our_payload = our_kexinit.to_bytes();

        self.transport.begin_rekey();
        self.transport.send_payload(&our_payload).await?;

        let peer_payload = match peer_kexinit {
            Some(payload) => payload,
            None => loop {
                let payload = self.transport.next_payload().await?;
                let msg_type = payload[0];
                if msg_type == MessageType::KexInit as u8 {
                    break payload;
                }
                if allowed_during_kex(msg_type) {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Handshake,
                            &format!("Expected KEXINIT, got message type {}", msg_type),
                        )
                        .await);
                }
                if let Err(e) = self.transport.queue_inbound(payload) {
                    let message = e.to_string();
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Protocol,
                            &message,
                        )
                        .await);
                }
            },
        };
        let peer_kexinit = KexInit::from_bytes(&peer_payload)?;

        let negotiated = match negotiate(&our_kexinit, &peer_kexinit) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                let message = e.to_string();
                return Err(self
                    .fail(
                        DisconnectReason::KeyExchangeFailed,
                        DisconnectLevel::Handshake,
                        &message,
                    )
                    .await);
            }
        };
        debug!(kex = negotiated.kex.name(), "algorithms negotiated");

        if guess_mismatched(&peer_kexinit, negotiated.kex) {
            self.transport.ignore_next_packet();
        }

        let kex_result = self
            .run_kex_method(negotiated.kex, &our_payload, &peer_payload)
            .await;
        let (shared_secret, exchange_hash, host_key_blob) = match kex_result {
            Ok(values) => values,
            Err(e) => {
                let message = e.to_string();
                return Err(self
                    .fail(
                        DisconnectReason::KeyExchangeFailed,
                        DisconnectLevel::Handshake,
                        &message,
                    )
                    .await);
            }
        };

        // The async verification checkpoint, re-entrant against an early
        // NEWKEYS from the server.
        let newkeys_seen = match self.verify_host_key(&host_key_blob).await? {
            HostKeyVerdict::Rejected => {
                return Err(self
                    .fail(
                        DisconnectReason::HostKeyNotVerifiable,
                        DisconnectLevel::Handshake,
                        "Host fingerprint verification failed",
                    )
                    .await)
            }
            HostKeyVerdict::Approved { newkeys_seen } => newkeys_seen,
        };
        self.server_host_key = Some(host_key_blob);

        self.transport.set_session_id(&exchange_hash);
        let session_id = self.transport.session_id().expect("just set").to_vec();

        let hash = KexHash::for_method(negotiated.kex);
        let (outgoing, incoming) = derive_transport_keys(
            hash,
            &shared_secret,
            &exchange_hash,
            &session_id,
            &negotiated,
            Role::Client,
        );

        self.transport.send_payload(&NewKeys::new().to_bytes()).await?;
        self.transport.install_outgoing(outgoing)?;

        if !newkeys_seen {
            self.await_newkeys().await?;
        }
        self.transport.install_incoming(incoming)?;

        self.transport.finish_rekey().await?;
        for payload in self.transport.take_inbound_queue() {
            self.pending_inbound.push_back(payload);
        }
        Ok(())
    }

    async fn await_newkeys(&mut self) -> SkiffResult<()> {
        loop {
            let payload = self.transport.next_payload().await?;
            let msg_type = payload[0];
            if msg_type == MessageType::NewKeys as u8 {
                return Ok(());
            }
            if allowed_during_kex(msg_type) {
                return Err(self
                    .fail(
                        DisconnectReason::ProtocolError,
                        DisconnectLevel::Handshake,
                        &format!("Unexpected message type {} during key exchange", msg_type),
                    )
                    .await);
            }
            self.transport.queue_inbound(payload)?;
        }
    }

    /// Runs the client side of the negotiated kex method. Returns
    /// `(shared_secret, exchange_hash, host_key_blob)` after the server's
    /// signature over the exchange hash has been verified.
    async fn run_kex_method(
        &mut self,
        method: KexMethod,
        our_kexinit_payload: &[u8],
        peer_kexinit_payload: &[u8],
    ) -> SkiffResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let client_version = self.transport.local_version().to_string();
        let server_version = self
            .transport
            .peer_version()
            .map(|v| v.to_string())
            .ok_or_else(|| SkiffError::Protocol("No peer identification".to_string()))?;
        let hash = KexHash::for_method(method);

        enum Exchange {
            Dh(DhExchange, Option<(Vec<u8>, Vec<u8>)>),
            Ecdh(EcdhExchange),
        }

        let (exchange, reply_type) = match method {
            KexMethod::DhGroup1Sha1 => {
                let exchange = DhExchange::group1();
                self.send_kex_public(kex_msg::DH_INIT, exchange.public_value(), false)
                    .await?;
                (Exchange::Dh(exchange, None), kex_msg::DH_REPLY)
            }
            KexMethod::DhGroup14Sha1 => {
                let exchange = DhExchange::group14();
                self.send_kex_public(kex_msg::DH_INIT, exchange.public_value(), false)
                    .await?;
                (Exchange::Dh(exchange, None), kex_msg::DH_REPLY)
            }
            KexMethod::DhGexSha1 | KexMethod::DhGexSha256 => {
                // Request the group: min/preferred/max bits.
                let mut w = WireWriter::with_capacity(13);
                w.put_u8(kex_msg::GEX_REQUEST);
                w.put_u32(GEX_MIN_BITS);
                w.put_u32(GEX_PREFERRED_BITS);
                w.put_u32(GEX_MAX_BITS);
                self.transport.send_payload(&w.into_bytes()).await?;

                // KEX_DH_GEX_GROUP carries p and g.
                let group_payload = self.expect_kex_message(kex_msg::DH_REPLY).await?;
                let mut r = WireReader::at(&group_payload, 1);
                let truncated =
                    || SkiffError::Protocol("Truncated KEX_DH_GEX_GROUP".to_string());
                let p = r.take_mpint().ok_or_else(truncated)?.to_vec();
                let g = r.take_mpint().ok_or_else(truncated)?.to_vec();

                let exchange = DhExchange::from_gex_group(&p, &g)?;
                self.send_kex_public(kex_msg::GEX_INIT, exchange.public_value(), false)
                    .await?;
                (Exchange::Dh(exchange, Some((p, g))), kex_msg::GEX_REPLY)
            }
            KexMethod::EcdhNistP256 | KexMethod::EcdhNistP384 | KexMethod::EcdhNistP521 => {
                let exchange = EcdhExchange::new(method)?;
                self.send_kex_public(kex_msg::DH_INIT, &exchange.public_value(), true)
                    .await?;
                (Exchange::Ecdh(exchange), kex_msg::DH_REPLY)
            }
        };

        // The server reply: K_S, f/Q_S, signature over H.
        let reply = self.expect_kex_message(reply_type).await?;
        let mut r = WireReader::at(&reply, 1);
        let truncated = || SkiffError::Protocol("Truncated kex reply".to_string());
        let host_key_blob = r.take_string().ok_or_else(truncated)?.to_vec();
        let server_public = r.take_string().ok_or_else(truncated)?.to_vec();
        let signature = r.take_string().ok_or_else(truncated)?.to_vec();

        let (client_public, shared_secret, gex_params, ecdh) = match &exchange {
            Exchange::Dh(dh, gex) => (
                dh.public_value().to_vec(),
                dh.compute_shared_secret(&server_public)?,
                gex.clone(),
                false,
            ),
            Exchange::Ecdh(ecdh_exchange) => (
                ecdh_exchange.public_value(),
                ecdh_exchange.compute_shared_secret(&server_public)?,
                None,
                true,
            ),
        };

        let exchange_hash = compute_exchange_hash(
            hash,
            &ExchangeHashInputs {
                client_version: &client_version,
                server_version: &server_version,
                client_kexinit: our_kexinit_payload,
                server_kexinit: peer_kexinit_payload,
                host_key_blob: &host_key_blob,
                gex: gex_params.as_ref().map(|(p, g)| GexHashParams {
                    min: GEX_MIN_BITS,
                    preferred: GEX_PREFERRED_BITS,
                    max: GEX_MAX_BITS,
                    prime: p,
                    generator: g,
                }),
                client_public: &client_public,
                server_public: &server_public,
                shared_secret: &shared_secret,
                ecdh,
            },
        );

        if !verify_signature(&host_key_blob, &signature, &exchange_hash)? {
            return Err(SkiffError::Security(
                "Host key signature verification failed".to_string(),
            ));
        }

        Ok((shared_secret, exchange_hash, host_key_blob))
    }

    async fn send_kex_public(
        &mut self,
        msg_type: u8,
        public: &[u8],
        as_string: bool,
    ) -> SkiffResult<()> {
        let mut w = WireWriter::new();
        w.put_u8(msg_type);
        if as_string {
            w.put_string(public);
        } else {
            w.put_mpint(public);
        }
        self.transport.send_payload(&w.into_bytes()).await
    }

    async fn expect_kex_message(&mut self, expected: u8) -> SkiffResult<Vec<u8>> {
        loop {
            let payload = self.transport.next_payload().await?;
            let msg_type = payload[0];
            if msg_type == expected {
                return Ok(payload);
            }
            if allowed_during_kex(msg_type) {
                return Err(SkiffError::Protocol(format!(
                    "Expected kex message {}, got {}",
                    expected, msg_type
                )));
            }
            self.transport.queue_inbound(payload)?;
        }
    }

    async fn verify_host_key(&mut self, host_key_blob: &[u8]) -> SkiffResult<HostKeyVerdict> {
        let Some(verifier) = self.config.host_key_verifier.clone() else {
            return Ok(HostKeyVerdict::Approved {
                newkeys_seen: false,
            });
        };

        let info = HostKeyInfo {
            algorithm: crate::ssh::hostkey::blob_algorithm(host_key_blob)?,
            public_key_blob: host_key_blob.to_vec(),
            fingerprint: fingerprint(host_key_blob),
        };
        debug!(fingerprint = %info.fingerprint, "awaiting host key verification");

        let fut = verifier(info);
        tokio::pin!(fut);

        // Awaiting-verification state: the server's NEWKEYS may land before
        // the verdict and must be remembered, not acted on.
        let mut newkeys_seen = false;
        let approved = loop {
            tokio::select! {
                verdict = &mut fut => break verdict,
                payload = self.transport.next_payload(), if !newkeys_seen => {
                    let payload = payload?;
                    let msg_type = payload[0];
                    if msg_type == MessageType::NewKeys as u8 {
                        newkeys_seen = true;
                    } else if allowed_during_kex(msg_type) {
                        return Err(SkiffError::Protocol(format!(
                            "Unexpected message type {} while verifying host key",
                            msg_type
                        )));
                    } else {
                        self.transport.queue_inbound(payload)?;
                    }
                }
            }
        };

        if approved {
            Ok(HostKeyVerdict::Approved { newkeys_seen })
        } else {
            Ok(HostKeyVerdict::Rejected)
        }
    }

    // -- authentication -----------------------------------------------------

    /// Requests the `ssh-userauth` service; must precede any auth attempt.
    pub async fn request_userauth(&mut self) -> SkiffResult<()> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::ServiceRequest as u8);
        w.put_string(b"ssh-userauth");
        self.transport.send_payload(&w.into_bytes()).await?;

        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::ServiceAccept as u8 => return Ok(()),
                t if t == MessageType::UserauthBanner as u8 => {
                    self.store_banner(&payload);
                }
                t => {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Handshake,
                            &format!("Expected SERVICE_ACCEPT, got message type {}", t),
                        )
                        .await)
                }
            }
        }
    }

    fn store_banner(&mut self, payload: &[u8]) {
        if let Ok(banner) = AuthBanner::from_bytes(payload) {
            debug!(message = %banner.message, "userauth banner");
            self.banner = Some(banner.message);
        }
    }

    /// Attempts the "none" method (commonly used to learn the method list).
    pub async fn auth_none(&mut self, username: &str) -> SkiffResult<AuthOutcome> {
        let request = AuthRequest::new(username, "ssh-connection", AuthMethod::None);
        self.transport.send_payload(&request.to_bytes()).await?;
        self.pending_methods.push("none");
        self.read_auth_outcome(username).await
    }

    /// Attempts password authentication.
    pub async fn auth_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> SkiffResult<AuthOutcome> {
        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::Password {
                password: password.to_string(),
                new_password: None,
            },
        );
        self.transport.send_payload(&request.to_bytes()).await?;
        self.pending_methods.push("password");
        self.read_auth_outcome(username).await
    }

    /// Attempts public-key authentication: an unsigned probe first, then
    /// the signed request when the server answers PK_OK.
    pub async fn auth_publickey(
        &mut self,
        username: &str,
        key: &KeyMaterial,
    ) -> SkiffResult<AuthOutcome> {
        let algorithm = key.algorithm().name().to_string();
        let blob = key.public_blob().to_vec();
        self.signing_key = Some(key.into_host_key()?);

        let probe = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm,
                public_key: blob,
                signature: None,
            },
        );
        self.transport.send_payload(&probe.to_bytes()).await?;
        self.pending_methods.push("publickey");

        let outcome = self.read_auth_outcome(username).await;
        self.signing_key = None;
        outcome
    }

    /// Internal continuation for the signed public-key phase, entered when
    /// PK_OK arrives inside [`read_auth_outcome`].
    async fn send_signed_publickey(
        &mut self,
        username: &str,
        pk_ok: &AuthPkOk,
    ) -> SkiffResult<()> {
        // Reconstruct the exact signed blob from the key we probed with.
        let session_id = self
            .transport
            .session_id()
            .ok_or_else(|| SkiffError::Protocol("No session id for signing".to_string()))?
            .to_vec();
        let data = crate::ssh::auth::publickey_signature_data(
            &session_id,
            username,
            "ssh-connection",
            &pk_ok.algorithm,
            &pk_ok.public_key,
        );
        let key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("No signing key staged".to_string()))?;
        let signature = key.sign(&data)?;

        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: pk_ok.algorithm.clone(),
                public_key: pk_ok.public_key.clone(),
                signature: Some(signature),
            },
        );
        self.transport.send_payload(&request.to_bytes()).await?;
        self.pending_methods.push("publickey");
        Ok(())
    }

    /// Attempts keyboard-interactive authentication; `responder` answers
    /// each prompt round.
    pub async fn auth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn FnMut(&InfoRequest) -> Vec<String>,
    ) -> SkiffResult<AuthOutcome> {
        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: Vec::new(),
            },
        );
        self.transport.send_payload(&request.to_bytes()).await?;
        self.pending_methods.push("keyboard-interactive");

        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::UserauthSuccess as u8 => {
                    self.finish_auth(username);
                    return Ok(AuthOutcome::Success);
                }
                t if t == MessageType::UserauthFailure as u8 => {
                    let failure = AuthFailure::from_bytes(&payload)?;
                    self.pending_methods.resolve();
                    return Ok(AuthOutcome::Failure {
                        methods: failure.methods,
                        partial: failure.partial_success,
                    });
                }
                t if t == MessageType::UserauthBanner as u8 => {
                    self.store_banner(&payload);
                }
                t if t == auth_msg::METHOD_SPECIFIC_1 => {
                    // INFO_REQUEST while keyboard-interactive is outstanding.
                    let info = InfoRequest::from_bytes(&payload)?;
                    let answers = responder(&info);
                    let response = InfoResponse { responses: answers };
                    self.transport.send_payload(&response.to_bytes()).await?;
                }
                t if t == MessageType::KexInit as u8 => {
                    self.key_exchange(Some(payload)).await?;
                }
                t if t == MessageType::Unimplemented as u8 => {}
                t => {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Protocol,
                            &format!("Unexpected message type {} during authentication", t),
                        )
                        .await)
                }
            }
        }
    }

    fn finish_auth(&mut self, username: &str) {
        self.pending_methods.resolve();
        self.authenticated = true;
        self.username = Some(username.to_string());
        self.transport.mark_authenticated();
        debug!(%username, "authentication complete");
    }

    /// Reads responses until the outstanding method resolves. Packet types
    /// 60/61 are interpreted against the pending-method queue.
    async fn read_auth_outcome(&mut self, username: &str) -> SkiffResult<AuthOutcome> {
        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::UserauthSuccess as u8 => {
                    self.finish_auth(username);
                    return Ok(AuthOutcome::Success);
                }
                t if t == MessageType::UserauthFailure as u8 => {
                    let failure = AuthFailure::from_bytes(&payload)?;
                    self.pending_methods.resolve();
                    return Ok(AuthOutcome::Failure {
                        methods: failure.methods,
                        partial: failure.partial_success,
                    });
                }
                t if t == MessageType::UserauthBanner as u8 => {
                    self.store_banner(&payload);
                }
                t if t == auth_msg::METHOD_SPECIFIC_1 => {
                    match self.pending_methods.outstanding() {
                        Some("publickey") => {
                            // PK_OK: move to the signed phase.
                            let pk_ok = AuthPkOk::from_bytes(&payload)?;
                            self.pending_methods.resolve();
                            self.send_signed_publickey(username, &pk_ok).await?;
                        }
                        Some("password") => {
                            // PASSWD_CHANGEREQ.
                            let mut r = WireReader::at(&payload, 1);
                            let prompt = r.take_utf8().unwrap_or_default();
                            self.pending_methods.resolve();
                            return Ok(AuthOutcome::ChangeRequired(prompt));
                        }
                        other => {
                            warn!(?other, "type 60 with no matching outstanding method");
                            return Err(self
                                .fail(
                                    DisconnectReason::ProtocolError,
                                    DisconnectLevel::Protocol,
                                    "Method-specific message without outstanding method",
                                )
                                .await);
                        }
                    }
                }
                t if t == MessageType::KexInit as u8 => {
                    self.key_exchange(Some(payload)).await?;
                }
                t if t == MessageType::Unimplemented as u8 => {}
                t => {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Protocol,
                            &format!("Unexpected message type {} during authentication", t),
                        )
                        .await)
                }
            }
        }
    }

    // -- connection protocol ------------------------------------------------

    /// Opens a session channel and returns its local id.
    pub async fn open_session(&mut self) -> SkiffResult<u32> {
        let local_id = self
            .channels
            .reserve(self.config.high_water_mark, self.config.max_packet_size)?;
        let open = ChannelOpen::new(
            ChannelType::Session,
            local_id,
            self.config.high_water_mark,
            self.config.max_packet_size,
        );
        self.transport.send_payload(&open.to_bytes()).await?;

        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::ChannelOpenConfirmation as u8 => {
                    let confirmation = ChannelOpenConfirmation::from_bytes(&payload)?;
                    let channel = self.channels.expect_mut(local_id)?;
                    channel.confirm(
                        confirmation.sender_channel,
                        confirmation.initial_window_size,
                        confirmation.maximum_packet_size,
                    );
                    return Ok(local_id);
                }
                t if t == MessageType::ChannelOpenFailure as u8 => {
                    let failure = ChannelOpenFailure::from_bytes(&payload)?;
                    self.channels.release(local_id);
                    return Err(SkiffError::Protocol(format!(
                        "Channel open failed ({:?}): {}",
                        failure.reason, failure.description
                    )));
                }
                _ => self.handle_out_of_band(payload).await?,
            }
        }
    }

    /// Sends data on an open channel, consuming the remote window.
    pub async fn send_channel_data(&mut self, channel_id: u32, data: &[u8]) -> SkiffResult<()> {
        let channel = self.channels.expect_mut(channel_id)?;
        let peer_id = channel
            .peer_id
            .ok_or_else(|| SkiffError::Protocol("Channel not yet confirmed".to_string()))?;
        if channel.state != crate::ssh::channel::ChannelState::Open {
            return Err(SkiffError::Protocol(
                "Channel is not open for data".to_string(),
            ));
        }
        if data.len() as u32 > channel.remote_max_packet {
            return Err(SkiffError::Protocol(format!(
                "Data exceeds the peer's maximum packet size ({} bytes)",
                channel.remote_max_packet
            )));
        }
        if !channel.consume_remote_window(data.len() as u32) {
            return Err(SkiffError::Protocol(
                "Channel send window exhausted".to_string(),
            ));
        }
        let message = ChannelData {
            recipient_channel: peer_id,
            data: data.to_vec(),
        };
        self.transport.send_payload(&message.to_bytes()).await
    }

    /// Executes a command over a fresh session channel and collects its
    /// output until the channel closes.
    pub async fn execute(&mut self, command: &str) -> SkiffResult<Vec<u8>> {
        let channel_id = self.open_session().await?;
        let peer_id = self
            .channels
            .get(channel_id)
            .and_then(|c| c.peer_id)
            .expect("confirmed channel has a peer id");

        let request = ChannelRequest {
            recipient_channel: peer_id,
            want_reply: true,
            request: ChannelRequestType::Exec {
                command: command.to_string(),
            },
        };
        self.transport.send_payload(&request.to_bytes()).await?;

        let mut output = Vec::new();
        let mut accepted = false;

        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::ChannelSuccess as u8 => {
                    accepted = true;
                }
                t if t == MessageType::ChannelFailure as u8 => {
                    return Err(SkiffError::Protocol(format!(
                        "exec request rejected: {}",
                        command
                    )));
                }
                t if t == MessageType::ChannelData as u8 => {
                    let data = ChannelData::from_bytes(&payload)?;
                    if data.recipient_channel == channel_id {
                        let channel = self.channels.expect_mut(channel_id)?;
                        if !channel.consume_local_window(data.data.len() as u32) {
                            return Err(self
                                .fail(
                                    DisconnectReason::ProtocolError,
                                    DisconnectLevel::Protocol,
                                    "Channel data exceeds granted window",
                                )
                                .await);
                        }
                        output.extend_from_slice(&data.data);
                        self.replenish_window(channel_id).await?;
                    }
                }
                t if t == MessageType::ChannelExtendedData as u8 => {
                    // stderr is collected with stdout for this simple API.
                    let data =
                        crate::ssh::connection::ChannelExtendedData::from_bytes(&payload)?;
                    if data.recipient_channel == channel_id {
                        output.extend_from_slice(&data.data);
                    }
                }
                t if t == MessageType::ChannelRequest as u8 => {
                    // exit-status / exit-signal arrive here; no reply wanted.
                    let _request = ChannelRequest::from_bytes(&payload)?;
                }
                t if t == MessageType::ChannelEof as u8 => {
                    if let Ok(id) = crate::ssh::connection::parse_channel_id(&payload) {
                        if let Some(channel) = self.channels.get_mut(id) {
                            channel.note_remote_eof();
                        }
                    }
                }
                t if t == MessageType::ChannelClose as u8 => {
                    let id = crate::ssh::connection::parse_channel_id(&payload)?;
                    if id == channel_id {
                        let close = channel_id_message(MessageType::ChannelClose, peer_id);
                        self.transport.send_payload(&close).await?;
                        if let Some(channel) = self.channels.get_mut(id) {
                            channel.note_remote_close();
                            channel.note_local_close();
                        }
                        self.channels.remove_closed(id);
                        if !accepted {
                            warn!("channel closed before the exec request was answered");
                        }
                        return Ok(output);
                    }
                }
                t if t == MessageType::ChannelWindowAdjust as u8 => {
                    let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
                    if let Some(channel) = self.channels.get_mut(adjust.recipient_channel) {
                        channel.grow_remote_window(adjust.bytes_to_add);
                    }
                }
                _ => self.handle_out_of_band(payload).await?,
            }
        }
    }

    /// Requests a named subsystem (e.g. `sftp`) on an open channel.
    pub async fn request_subsystem(&mut self, channel_id: u32, name: &str) -> SkiffResult<()> {
        let peer_id = self
            .channels
            .get(channel_id)
            .and_then(|c| c.peer_id)
            .ok_or_else(|| SkiffError::Protocol("Channel not yet confirmed".to_string()))?;

        let request = ChannelRequest {
            recipient_channel: peer_id,
            want_reply: true,
            request: ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
        };
        self.transport.send_payload(&request.to_bytes()).await?;

        loop {
            let payload = self.next_message().await?;
            match payload[0] {
                t if t == MessageType::ChannelSuccess as u8 => return Ok(()),
                t if t == MessageType::ChannelFailure as u8 => {
                    return Err(SkiffError::Protocol(format!(
                        "subsystem request rejected: {}",
                        name
                    )))
                }
                _ => self.handle_out_of_band(payload).await?,
            }
        }
    }

    async fn replenish_window(&mut self, channel_id: u32) -> SkiffResult<()> {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return Ok(());
        };
        let deficit = self
            .config
            .high_water_mark
            .saturating_sub(channel.local_window);
        if deficit >= self.config.high_water_mark / 2 {
            channel.grow_local_window(deficit);
            let peer_id = channel.peer_id.unwrap_or(channel_id);
            let adjust = ChannelWindowAdjust {
                recipient_channel: peer_id,
                bytes_to_add: deficit,
            };
            self.transport.send_payload(&adjust.to_bytes()).await?;
        }
        Ok(())
    }

    /// Handles messages that may arrive inside any wait loop: server
    /// rekeys, global requests (keepalive probes), and unknown types.
    async fn handle_out_of_band(&mut self, payload: Vec<u8>) -> SkiffResult<()> {
        match payload[0] {
            t if t == MessageType::KexInit as u8 => self.key_exchange(Some(payload)).await,
            t if t == MessageType::GlobalRequest as u8 => {
                let request = GlobalRequest::from_bytes(&payload)?;
                if request.want_reply {
                    // Keepalive probes count a failure reply as liveness.
                    let reply = vec![MessageType::RequestFailure as u8];
                    self.transport.send_payload(&reply).await?;
                }
                Ok(())
            }
            t if t == MessageType::RequestSuccess as u8
                || t == MessageType::RequestFailure as u8
                || t == MessageType::Unimplemented as u8 =>
            {
                Ok(())
            }
            _ => {
                let seq = self.transport.last_recv_seq();
                self.transport
                    .send_payload(&Transport::<S>::unimplemented_payload(seq))
                    .await
            }
        }
    }

    /// Sends a keepalive probe (a global request expecting a reply).
    pub async fn send_keepalive(&mut self) -> SkiffResult<()> {
        let probe = GlobalRequest {
            want_reply: true,
            request: GlobalRequestType::Unknown {
                name: KEEPALIVE_REQUEST.to_string(),
                data: Vec::new(),
            },
        };
        self.transport.send_payload(&probe.to_bytes()).await
    }

    /// Closes the connection gracefully.
    pub async fn disconnect(&mut self) -> SkiffResult<()> {
        self.transport.close().await
    }

    async fn fail(
        &mut self,
        reason: DisconnectReason,
        level: DisconnectLevel,
        message: &str,
    ) -> SkiffError {
        self.transport.disconnect_with(reason, level, message).await
    }
}

enum HostKeyVerdict {
    Approved { newkeys_seen: bool },
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SshClientConfig::default();
        assert!(config.ident.starts_with("Skiff_"));
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert!(config.host_key_verifier.is_none());
    }

    #[test]
    fn test_config_debug_hides_verifier() {
        let mut config = SshClientConfig::default();
        config.host_key_verifier = Some(Arc::new(|_| Box::pin(async { true })));
        let debugged = format!("{:?}", config);
        assert!(debugged.contains("<callback>"));
    }

    #[tokio::test]
    async fn test_from_stream_validates_algorithms() {
        let (stream, _other) = tokio::io::duplex(64);
        let mut config = SshClientConfig::default();
        config.algorithms.kex = Some(vec!["post-quantum-magic".to_string()]);
        assert!(matches!(
            SshClient::from_stream(stream, config),
            Err(SkiffError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_client_accepts_gex_in_kex_list() {
        let (stream, _other) = tokio::io::duplex(64);
        let mut config = SshClientConfig::default();
        config.algorithms.kex = Some(vec![
            "diffie-hellman-group-exchange-sha256".to_string(),
        ]);
        assert!(SshClient::from_stream(stream, config).is_ok());
    }
}
