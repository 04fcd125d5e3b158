//! SSH server: listener, per-connection session driver, authentication and
//! channel dispatch.
//!
//! A [`SshServerSession`] drives one connection through the transport
//! handshake ([`handshake`](SshServerSession::handshake)), the userauth
//! service ([`authenticate`](SshServerSession::authenticate)) and the
//! connection protocol ([`serve`](SshServerSession::serve)). Application
//! behavior plugs in through two traits:
//!
//! - [`AuthHandler`] decides authentication attempts; without one every
//!   attempt is rejected
//! - [`SessionHandler`] receives channel events (shell, exec, subsystem,
//!   pty, env, signals, forwarding requests); unimplemented events are
//!   auto-rejected when the peer wants a reply and silently dropped
//!   otherwise
//!
//! Sessions are generic over the byte stream so tests can run them over
//! in-memory duplex pipes; [`SshServer`] provides the TCP listener
//! convenience.

use crate::ssh::auth::{
    AuthFailure, AuthMethod, AuthPkOk, AuthRequest, AuthSequencer, InfoRequest, InfoResponse,
    PushOutcome,
};
use crate::ssh::channel::{ChannelTable, GlobalRequestQueue};
use crate::ssh::connection::{
    channel_id_message, ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelRequestType, ChannelType, ChannelWindowAdjust, GlobalRequest,
    GlobalRequestType, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
use crate::ssh::hostkey::{verify_signature, HostKey};
use crate::ssh::kex::{
    guess_mismatched, negotiate, AlgorithmPreferences, KexInit, KexMethod, NegotiatedAlgorithms,
    NewKeys,
};
use crate::ssh::kex_dh::{
    compute_exchange_hash, derive_transport_keys, DhExchange, EcdhExchange, ExchangeHashInputs,
    KexHash,
};
use crate::ssh::message::{
    allowed_during_kex, kex_msg, ChannelOpenFailureReason, DisconnectReason, MessageType,
};
use crate::ssh::session::{KeepaliveHandle, KeepaliveRegistry, KeepaliveSignal, KEEPALIVE_REQUEST};
use crate::ssh::transport::{Role, Transport};
use crate::ssh::version::Version;
use crate::ssh::wire::{WireReader, WireWriter};
use async_trait::async_trait;
use skiff_platform::{DisconnectLevel, SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SshServerConfig {
    /// Software banner suffix for the identification line.
    pub ident: String,
    /// Free-text greeting sent before the identification line.
    pub greeting: Option<String>,
    /// Userauth banner shown to clients before authentication.
    pub banner: Option<String>,
    /// Ordered algorithm preference overrides.
    pub algorithms: AlgorithmPreferences,
    /// Initial per-channel receive window granted to clients.
    pub window_size: u32,
    /// Maximum channel packet size granted to clients.
    pub max_packet_size: u32,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            ident: format!("Skiff_{}", env!("CARGO_PKG_VERSION")),
            greeting: None,
            banner: None,
            algorithms: AlgorithmPreferences::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Verdict on one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Authentication complete.
    Accept,
    /// Attempt failed.
    Reject,
    /// This method succeeded but further methods are required
    /// (partial success).
    Partial,
}

/// Outcome of one keyboard-interactive round.
#[derive(Debug)]
pub enum KbdRound {
    /// Authentication complete.
    Accept,
    /// Authentication failed.
    Reject,
    /// Another prompt round.
    Prompt(InfoRequest),
}

/// Application authentication policy. Every default rejects, matching the
/// auto-reject behavior when no handler is registered.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Methods advertised in USERAUTH_FAILURE replies.
    fn methods(&self) -> Vec<String> {
        vec!["password".to_string(), "publickey".to_string()]
    }

    /// Decides a "none" attempt.
    async fn auth_none(&self, _user: &str) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Decides a password attempt.
    async fn auth_password(&self, _user: &str, _password: &str) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Answers a public-key probe ("may I use this key").
    async fn offer_publickey(&self, _user: &str, _algorithm: &str, _blob: &[u8]) -> bool {
        false
    }

    /// Decides a signed public-key attempt. The signature has already been
    /// verified against the session identifier.
    async fn auth_publickey(&self, _user: &str, _algorithm: &str, _blob: &[u8]) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Decides a host-based attempt. The signature has already been
    /// verified.
    async fn auth_hostbased(
        &self,
        _user: &str,
        _hostname: &str,
        _local_user: &str,
        _blob: &[u8],
    ) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Starts a keyboard-interactive exchange.
    async fn kbd_start(&self, _user: &str, _submethods: &[String]) -> KbdRound {
        KbdRound::Reject
    }

    /// Judges one round of keyboard-interactive answers.
    async fn kbd_response(&self, _user: &str, _responses: &[String]) -> KbdRound {
        KbdRound::Reject
    }
}

/// The no-handler policy: rejects everything.
#[derive(Debug, Default)]
pub struct DenyAllAuth;

#[async_trait]
impl AuthHandler for DenyAllAuth {}

/// Application channel/session event handler. Defaults auto-reject events
/// the peer wants replies for.
#[async_trait]
pub trait SessionHandler: Send {
    /// A shell was requested; return its initial output to accept.
    async fn handle_shell(&mut self) -> SkiffResult<Vec<u8>> {
        Err(SkiffError::NotImplemented("shell".to_string()))
    }

    /// A command execution was requested; return its output to accept.
    async fn handle_exec(&mut self, _command: &str) -> SkiffResult<Vec<u8>> {
        Err(SkiffError::NotImplemented("exec".to_string()))
    }

    /// A subsystem was requested (the `sftp` name arrives here; its
    /// message body is piped by the application, not this crate).
    async fn handle_subsystem(&mut self, _name: &str) -> bool {
        false
    }

    /// A pty was requested.
    async fn handle_pty(&mut self, _term: &str, _cols: u32, _rows: u32) -> bool {
        false
    }

    /// The client terminal was resized.
    async fn handle_window_change(&mut self, _cols: u32, _rows: u32) {}

    /// An environment variable was passed.
    async fn handle_env(&mut self, _name: &str, _value: &str) {}

    /// A signal was delivered.
    async fn handle_signal(&mut self, _signal: &str) {}

    /// X11 forwarding was requested for the session.
    async fn handle_x11_req(&mut self, _single_connection: bool, _protocol: &str) -> bool {
        false
    }

    /// Agent forwarding was requested.
    async fn handle_auth_agent(&mut self) -> bool {
        false
    }

    /// Channel data arrived.
    async fn handle_data(&mut self, _channel: u32, _data: &[u8]) -> SkiffResult<()> {
        Ok(())
    }

    /// An outbound TCP forwarding channel (`direct-tcpip`) was requested.
    async fn handle_direct_tcpip(
        &mut self,
        _host: &str,
        _port: u32,
        _originator_address: &str,
        _originator_port: u32,
    ) -> bool {
        false
    }

    /// A remote TCP listen was requested; return the bound port to accept.
    async fn handle_tcpip_forward(&mut self, _address: &str, _port: u32) -> Option<u32> {
        None
    }

    /// A remote TCP listen was cancelled.
    async fn handle_cancel_tcpip_forward(&mut self, _address: &str, _port: u32) -> bool {
        false
    }

    /// A Unix-socket listen was requested.
    async fn handle_streamlocal_forward(&mut self, _path: &str) -> bool {
        false
    }
}

/// TCP listener handing out server sessions.
pub struct SshServer {
    listener: TcpListener,
    config: SshServerConfig,
    host_keys: Vec<Arc<dyn HostKey>>,
    auth: Arc<dyn AuthHandler>,
    keepalive: Option<Arc<KeepaliveRegistry>>,
}

impl SshServer {
    /// Binds a listener.
    ///
    /// # Errors
    ///
    /// Configuration problems (unknown algorithm names, group-exchange in
    /// the server kex list, empty host key set) surface here, before any
    /// wire activity.
    pub async fn bind(
        addr: &str,
        config: SshServerConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
        auth: Arc<dyn AuthHandler>,
    ) -> SkiffResult<Self> {
        config.algorithms.validate(true)?;
        if host_keys.is_empty() {
            return Err(SkiffError::Config(
                "At least one host key is required".to_string(),
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            host_keys,
            auth,
            keepalive: None,
        })
    }

    /// Shares a keepalive registry across this server's sessions.
    pub fn set_keepalive(&mut self, registry: Arc<KeepaliveRegistry>) {
        self.keepalive = Some(registry);
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection and wraps it in a session (no bytes are
    /// exchanged yet).
    pub async fn accept(&self) -> SkiffResult<SshServerSession<TcpStream>> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "connection accepted");
        let mut session = SshServerSession::from_stream(
            stream,
            self.config.clone(),
            self.host_keys.clone(),
            Arc::clone(&self.auth),
        )?;
        if let Some(registry) = &self.keepalive {
            session.register_keepalive(registry);
        }
        Ok(session)
    }
}

/// One server-side connection.
pub struct SshServerSession<S> {
    transport: Transport<S>,
    config: SshServerConfig,
    host_keys: Vec<Arc<dyn HostKey>>,
    auth: Arc<dyn AuthHandler>,
    sequencer: AuthSequencer,
    channels: ChannelTable,
    global_replies: GlobalRequestQueue,
    pending_inbound: VecDeque<Vec<u8>>,
    authenticated_user: Option<String>,
    service_accepted: bool,
    no_more_sessions: bool,
    keepalive: Option<(KeepaliveHandle, mpsc::UnboundedReceiver<KeepaliveSignal>)>,
}

impl<S> SshServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an accepted byte stream.
    pub fn from_stream(
        stream: S,
        config: SshServerConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
        auth: Arc<dyn AuthHandler>,
    ) -> SkiffResult<Self> {
        config.algorithms.validate(true)?;
        if host_keys.is_empty() {
            return Err(SkiffError::Config(
                "At least one host key is required".to_string(),
            ));
        }
        let version = Version::new(&config.ident, None);
        Ok(Self {
            transport: Transport::new(stream, Role::Server, version),
            config,
            host_keys,
            auth,
            sequencer: AuthSequencer::new(),
            channels: ChannelTable::new(),
            global_replies: GlobalRequestQueue::new(),
            pending_inbound: VecDeque::new(),
            authenticated_user: None,
            service_accepted: false,
            no_more_sessions: false,
            keepalive: None,
        })
    }

    /// Registers this session with a shared keepalive registry.
    pub fn register_keepalive(&mut self, registry: &Arc<KeepaliveRegistry>) {
        self.keepalive = Some(registry.register());
    }

    /// Returns the authenticated username, once authentication completed.
    pub fn username(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    /// Returns whether authentication completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    fn note_activity(&self) {
        if let Some((handle, _)) = &self.keepalive {
            handle.activity();
        }
    }

    async fn next_message(&mut self) -> SkiffResult<Vec<u8>> {
        if let Some(payload) = self.pending_inbound.pop_front() {
            return Ok(payload);
        }
        let payload = self.transport.next_payload().await?;
        self.note_activity();
        Ok(payload)
    }

    // -- handshake ----------------------------------------------------------

    /// Performs the identification exchange and the first key exchange.
    pub async fn handshake(&mut self) -> SkiffResult<()> {
        let greeting = self.config.greeting.clone();
        self.transport
            .exchange_identification(greeting.as_deref())
            .await?;
        self.key_exchange(None).await
    }

    /// Runs one server-side key exchange. `peer_kexinit` carries the
    /// payload when the peer initiated the rekey.
    async fn key_exchange(&mut self, peer_kexinit: Option<Vec<u8>>) -> SkiffResult<()> {
        let mut our_kexinit = KexInit::new_default_server();
        self.config.algorithms.apply(&mut our_kexinit);
        let our_payload = our_kexinit.to_bytes();

        self.transport.begin_rekey();
        self.transport.send_payload(&our_payload).await?;

        let peer_payload = match peer_kexinit {
            Some(payload) => payload,
            None => {
                let payload = self.transport.next_payload().await?;
                if payload.first() != Some(&(MessageType::KexInit as u8)) {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Handshake,
                            "Expected KEXINIT",
                        )
                        .await);
                }
                payload
            }
        };
        let peer_kexinit = KexInit::from_bytes(&peer_payload)?;

        let negotiated = match negotiate(&peer_kexinit, &our_kexinit) {
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
        debug!(kex = negotiated.kex.name(), host_key = negotiated.host_key.name(),
               "algorithms negotiated");

        if guess_mismatched(&peer_kexinit, negotiated.kex) {
            self.transport.ignore_next_packet();
        }

        let host_key = match self
            .host_keys
            .iter()
            .find(|k| k.algorithm() == negotiated.host_key)
        {
            Some(key) => Arc::clone(key),
            None => {
                return Err(self
                    .fail(
                        DisconnectReason::KeyExchangeFailed,
                        DisconnectLevel::Handshake,
                        "No host key for the negotiated format",
                    )
                    .await)
            }
        };

        let result = self
            .run_kex_method(&negotiated, &peer_payload, &our_payload, host_key)
            .await;
        let (shared_secret, exchange_hash) = match result {
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

        // Session id is fixed by the very first exchange hash.
        self.transport.set_session_id(&exchange_hash);
        let session_id = self.transport.session_id().expect("just set").to_vec();

        let hash = KexHash::for_method(negotiated.kex);
        let (outgoing, incoming) = derive_transport_keys(
            hash,
            &shared_secret,
            &exchange_hash,
            &session_id,
            &negotiated,
            Role::Server,
        );

        self.transport.send_payload(&NewKeys::new().to_bytes()).await?;
        self.transport.install_outgoing(outgoing)?;

        self.await_newkeys().await?;
        self.transport.install_incoming(incoming)?;

        self.transport.finish_rekey().await?;
        for payload in self.transport.take_inbound_queue() {
            self.pending_inbound.push_back(payload);
        }
        Ok(())
    }

    /// Waits for the peer's NEWKEYS, queueing non-transport packets that
    /// arrive mid-rekey.
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
        }
    }

    async fn run_kex_method(
        &mut self,
        negotiated: &NegotiatedAlgorithms,
        peer_kexinit_payload: &[u8],
        our_kexinit_payload: &[u8],
        host_key: Arc<dyn HostKey>,
    ) -> SkiffResult<(Vec<u8>, Vec<u8>)> {
        let client_version = self
            .transport
            .peer_version()
            .map(|v| v.to_string())
            .ok_or_else(|| SkiffError::Protocol("No peer identification".to_string()))?;
        let server_version = self.transport.local_version().to_string();
        let host_key_blob = host_key.public_key_blob();

        // The client's kex-range opener; non-kex stragglers queue.
        let init_payload = loop {
            let payload = self.transport.next_payload().await?;
            let msg_type = payload[0];
            if msg_type == kex_msg::DH_INIT {
                break payload;
            }
            if allowed_during_kex(msg_type) {
                return Err(SkiffError::Protocol(format!(
                    "Expected kex init message (30), got {}",
                    msg_type
                )));
            }
            self.transport.queue_inbound(payload)?;
        };
        let mut r = WireReader::at(&init_payload, 1);
        let client_public = r
            .take_string()
            .ok_or_else(|| SkiffError::Protocol("Truncated kex init message".to_string()))?
            .to_vec();

        let (server_public, shared_secret, ecdh) = match negotiated.kex {
            KexMethod::DhGroup1Sha1 => {
                let exchange = DhExchange::group1();
                let secret = exchange.compute_shared_secret(&client_public)?;
                (exchange.public_value().to_vec(), secret, false)
            }
            KexMethod::DhGroup14Sha1 => {
                let exchange = DhExchange::group14();
                let secret = exchange.compute_shared_secret(&client_public)?;
                (exchange.public_value().to_vec(), secret, false)
            }
            KexMethod::EcdhNistP256 | KexMethod::EcdhNistP384 | KexMethod::EcdhNistP521 => {
                let exchange = EcdhExchange::new(negotiated.kex)?;
                let secret = exchange.compute_shared_secret(&client_public)?;
                (exchange.public_value(), secret, true)
            }
            KexMethod::DhGexSha1 | KexMethod::DhGexSha256 => {
                // Never offered in the server proposal; a peer reaching this
                // point negotiated outside our list.
                return Err(SkiffError::NotImplemented(
                    "Group exchange in the server role".to_string(),
                ));
            }
        };

        let hash = KexHash::for_method(negotiated.kex);
        let exchange_hash = compute_exchange_hash(
            hash,
            &ExchangeHashInputs {
                client_version: &client_version,
                server_version: &server_version,
                client_kexinit: peer_kexinit_payload,
                server_kexinit: our_kexinit_payload,
                host_key_blob: &host_key_blob,
                gex: None,
                client_public: &client_public,
                server_public: &server_public,
                shared_secret: &shared_secret,
                ecdh,
            },
        );

        let signature = host_key.sign(&exchange_hash)?;

        let mut w = WireWriter::new();
        w.put_u8(kex_msg::DH_REPLY);
        w.put_string(&host_key_blob);
        if ecdh {
            w.put_string(&server_public);
        } else {
            w.put_mpint(&server_public);
        }
        w.put_string(&signature);
        self.transport.send_payload(&w.into_bytes()).await?;

        Ok((shared_secret, exchange_hash))
    }

    // -- authentication -----------------------------------------------------

    /// Runs the `ssh-userauth` service until a final accept.
    ///
    /// Returns the authenticated username. Service violations, queue
    /// overflow and malformed requests terminate the connection.
    pub async fn authenticate(&mut self) -> SkiffResult<String> {
        loop {
            let payload = self.next_message().await?;
            let msg_type = payload[0];

            match MessageType::from_u8(msg_type) {
                Some(MessageType::ServiceRequest) => {
                    self.handle_service_request(&payload).await?;
                }
                Some(MessageType::UserauthRequest) => {
                    if !self.service_accepted {
                        return Err(self
                            .fail(
                                DisconnectReason::ProtocolError,
                                DisconnectLevel::Handshake,
                                "USERAUTH_REQUEST before service acceptance",
                            )
                            .await);
                    }
                    if self.dispatch_auth_request(&payload).await? {
                        return Ok(self.authenticated_user.clone().expect("set on accept"));
                    }
                }
                Some(MessageType::KexInit) => {
                    self.key_exchange(Some(payload)).await?;
                }
                _ if msg_type == crate::ssh::message::auth_msg::METHOD_SPECIFIC_2 => {
                    if self.dispatch_info_response(&payload).await? {
                        return Ok(self.authenticated_user.clone().expect("set on accept"));
                    }
                }
                _ => {
                    let seq = self.transport.last_recv_seq();
                    self.transport
                        .send_payload(&Transport::<S>::unimplemented_payload(seq))
                        .await?;
                }
            }
        }
    }

    async fn handle_service_request(&mut self, payload: &[u8]) -> SkiffResult<()> {
        let mut r = WireReader::at(payload, 1);
        let service = r
            .take_utf8()
            .ok_or_else(|| SkiffError::Protocol("Truncated SERVICE_REQUEST".to_string()))?;

        if service != "ssh-userauth" {
            return Err(self
                .fail(
                    DisconnectReason::ServiceNotAvailable,
                    DisconnectLevel::Handshake,
                    &format!("Service not available: {}", service),
                )
                .await);
        }
        if self.service_accepted {
            return Err(self
                .fail(
                    DisconnectReason::ProtocolError,
                    DisconnectLevel::Handshake,
                    "Duplicate SERVICE_REQUEST",
                )
                .await);
        }

        let mut w = WireWriter::new();
        w.put_u8(MessageType::ServiceAccept as u8);
        w.put_string(service.as_bytes());
        self.transport.send_payload(&w.into_bytes()).await?;
        self.service_accepted = true;

        if let Some(banner) = self.config.banner.clone() {
            let banner_msg = crate::ssh::auth::AuthBanner {
                message: banner,
                language: String::new(),
            };
            self.transport.send_payload(&banner_msg.to_bytes()).await?;
        }
        Ok(())
    }

    /// Feeds a USERAUTH_REQUEST to the sequencer and dispatches whatever
    /// context became current. Returns true when authentication completed.
    async fn dispatch_auth_request(&mut self, payload: &[u8]) -> SkiffResult<bool> {
        let request = match AuthRequest::from_bytes(payload) {
            Ok(request) => request,
            Err(e) => {
                let message = e.to_string();
                return Err(self
                    .fail(
                        DisconnectReason::ProtocolError,
                        DisconnectLevel::Protocol,
                        &message,
                    )
                    .await);
            }
        };

        match self.sequencer.push_request(request) {
            Ok(PushOutcome::BecameCurrent) | Ok(PushOutcome::AbortedCurrent) => {
                self.drive_current_context().await
            }
            Ok(PushOutcome::Queued) => Ok(false),
            Err(e) => {
                let message = e.to_string();
                Err(self
                    .fail(
                        DisconnectReason::ProtocolError,
                        DisconnectLevel::Protocol,
                        &message,
                    )
                    .await)
            }
        }
    }

    /// Dispatches the current context and every context promoted after a
    /// rejection, until the queue drains or an accept lands.
    async fn drive_current_context(&mut self) -> SkiffResult<bool> {
        loop {
            let request = match self.sequencer.current() {
                Some(context) => context.request.clone(),
                None => return Ok(false),
            };
            let user = request.user_name.clone();

            enum Resolution {
                Verdict(AuthDecision),
                Probe(bool, String, Vec<u8>),
                KbdPrompt(InfoRequest),
            }

            let resolution = match &request.method {
                AuthMethod::None => Resolution::Verdict(self.auth.auth_none(&user).await),
                AuthMethod::Password { password, .. } => {
                    Resolution::Verdict(self.auth.auth_password(&user, password).await)
                }
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature: None,
                } => Resolution::Probe(
                    self.auth.offer_publickey(&user, algorithm, public_key).await,
                    algorithm.clone(),
                    public_key.clone(),
                ),
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature: Some(signature),
                } => {
                    let verdict = self
                        .verify_publickey(&request, algorithm, public_key, signature)
                        .await?;
                    Resolution::Verdict(verdict)
                }
                AuthMethod::HostBased {
                    algorithm,
                    host_key,
                    hostname,
                    local_user,
                    signature,
                } => {
                    let session_id = self
                        .transport
                        .session_id()
                        .expect("authentication runs after key exchange")
                        .to_vec();
                    let signed = crate::ssh::auth::hostbased_signature_data(
                        &session_id,
                        &request.user_name,
                        &request.service_name,
                        algorithm,
                        host_key,
                        hostname,
                        local_user,
                    );
                    let valid = verify_signature(host_key, signature, &signed).unwrap_or(false);
                    if valid {
                        Resolution::Verdict(
                            self.auth
                                .auth_hostbased(&user, hostname, local_user, host_key)
                                .await,
                        )
                    } else {
                        Resolution::Verdict(AuthDecision::Reject)
                    }
                }
                AuthMethod::KeyboardInteractive { submethods, .. } => {
                    match self.auth.kbd_start(&user, submethods).await {
                        KbdRound::Accept => Resolution::Verdict(AuthDecision::Accept),
                        KbdRound::Reject => Resolution::Verdict(AuthDecision::Reject),
                        KbdRound::Prompt(prompt) => Resolution::KbdPrompt(prompt),
                    }
                }
            };

            match resolution {
                Resolution::Probe(accepted, algorithm, public_key) => {
                    if accepted {
                        let pk_ok = AuthPkOk {
                            algorithm,
                            public_key,
                        };
                        self.transport.send_payload(&pk_ok.to_bytes()).await?;
                        // The probe resolves without consuming the queue.
                        if self.sequencer.complete_current().is_some() {
                            continue;
                        }
                        return Ok(false);
                    }
                    if self.send_verdict(AuthDecision::Reject, &user).await? {
                        return Ok(true);
                    }
                    if self.sequencer.current().is_some() {
                        continue;
                    }
                    return Ok(false);
                }
                Resolution::KbdPrompt(prompt) => {
                    self.transport.send_payload(&prompt.to_bytes()).await?;
                    self.sequencer.mark_engaged();
                    return Ok(false);
                }
                Resolution::Verdict(verdict) => {
                    if self.send_verdict(verdict, &user).await? {
                        return Ok(true);
                    }
                    if self.sequencer.current().is_some() {
                        continue;
                    }
                    return Ok(false);
                }
            }
        }
    }

    /// Sends the final response for the current context. Returns true when
    /// authentication completed.
    async fn send_verdict(&mut self, verdict: AuthDecision, user: &str) -> SkiffResult<bool> {
        match verdict {
            AuthDecision::Accept => {
                self.transport
                    .send_payload(&[MessageType::UserauthSuccess as u8])
                    .await?;
                self.sequencer.resolve_current(true);
                self.transport.mark_authenticated();
                self.authenticated_user = Some(user.to_string());
                debug!(%user, "authentication complete");
                Ok(true)
            }
            AuthDecision::Reject | AuthDecision::Partial => {
                let failure = AuthFailure {
                    methods: self.auth.methods(),
                    partial_success: verdict == AuthDecision::Partial,
                };
                self.transport.send_payload(&failure.to_bytes()).await?;
                self.sequencer.resolve_current(false);
                Ok(false)
            }
        }
    }

    async fn verify_publickey(
        &mut self,
        request: &AuthRequest,
        algorithm: &str,
        public_key: &[u8],
        signature: &[u8],
    ) -> SkiffResult<AuthDecision> {
        let session_id = self
            .transport
            .session_id()
            .expect("authentication runs after key exchange")
            .to_vec();
        let signed = crate::ssh::auth::publickey_signature_data(
            &session_id,
            &request.user_name,
            &request.service_name,
            algorithm,
            public_key,
        );
        if !verify_signature(public_key, signature, &signed).unwrap_or(false) {
            warn!(user = %request.user_name, "public key signature invalid");
            return Ok(AuthDecision::Reject);
        }
        Ok(self
            .auth
            .auth_publickey(&request.user_name, algorithm, public_key)
            .await)
    }

    /// Routes an INFO_RESPONSE to the engaged keyboard-interactive context.
    async fn dispatch_info_response(&mut self, payload: &[u8]) -> SkiffResult<bool> {
        let Some(context) = self.sequencer.current() else {
            return Err(self
                .fail(
                    DisconnectReason::ProtocolError,
                    DisconnectLevel::Protocol,
                    "INFO_RESPONSE without an authentication context",
                )
                .await);
        };
        let user = context.request.user_name.clone();

        let response = InfoResponse::from_bytes(payload)?;
        match self.auth.kbd_response(&user, &response.responses).await {
            KbdRound::Accept => self.send_verdict(AuthDecision::Accept, &user).await,
            KbdRound::Reject => {
                let done = self.send_verdict(AuthDecision::Reject, &user).await?;
                if !done && self.sequencer.current().is_some() {
                    return self.drive_current_context().await;
                }
                Ok(done)
            }
            KbdRound::Prompt(prompt) => {
                self.transport.send_payload(&prompt.to_bytes()).await?;
                Ok(false)
            }
        }
    }

    // -- connection service -------------------------------------------------

    /// Serves the `ssh-connection` protocol until the peer disconnects.
    ///
    /// Returns `Ok(())` on a clean application-level close.
    pub async fn serve<H: SessionHandler>(&mut self, handler: &mut H) -> SkiffResult<()> {
        loop {
            let payload = if self.pending_inbound.is_empty() {
                let (signal, payload) = match &mut self.keepalive {
                    Some((_, rx)) => {
                        // Probes only fire on idle streams, so cancelling
                        // the in-flight read cannot split a packet.
                        tokio::select! {
                            signal = rx.recv() => (Some(signal), None),
                            payload = self.transport.next_payload() => (None, Some(payload)),
                        }
                    }
                    None => (None, Some(self.transport.next_payload().await)),
                };

                match (signal, payload) {
                    (Some(None), _) => {
                        // The registry dropped this stream (timeout raced a
                        // deregistration); stop listening for signals.
                        self.keepalive = None;
                        continue;
                    }
                    (Some(Some(KeepaliveSignal::Probe)), _) => {
                        let probe = GlobalRequest {
                            want_reply: true,
                            request: GlobalRequestType::Unknown {
                                name: KEEPALIVE_REQUEST.to_string(),
                                data: Vec::new(),
                            },
                        };
                        self.transport.send_payload(&probe.to_bytes()).await?;
                        continue;
                    }
                    (Some(Some(KeepaliveSignal::Timeout)), _) => {
                        return Err(self
                            .fail(
                                DisconnectReason::ConnectionLost,
                                DisconnectLevel::Protocol,
                                "Keep-alive timeout (client-timeout)",
                            )
                            .await);
                    }
                    (_, Some(result)) => {
                        self.note_activity();
                        match result {
                            Ok(payload) => payload,
                            Err(SkiffError::Disconnect { code, .. })
                                if code == DisconnectReason::ByApplication as u32 =>
                            {
                                return Ok(());
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    (None, None) => continue,
                }
            } else {
                self.pending_inbound.pop_front().expect("checked non-empty")
            };

            if !self.dispatch_connection_message(handler, &payload).await? {
                return Ok(());
            }
        }
    }

    /// Handles one connection-protocol message. Returns false when the
    /// session should end.
    async fn dispatch_connection_message<H: SessionHandler>(
        &mut self,
        handler: &mut H,
        payload: &[u8],
    ) -> SkiffResult<bool> {
        let msg_type = payload[0];
        match MessageType::from_u8(msg_type) {
            Some(MessageType::KexInit) => {
                self.key_exchange(Some(payload.to_vec())).await?;
            }
            Some(MessageType::ServiceRequest) => {
                return Err(self
                    .fail(
                        DisconnectReason::ProtocolError,
                        DisconnectLevel::Protocol,
                        "SERVICE_REQUEST while ssh-connection is active",
                    )
                    .await);
            }
            Some(MessageType::GlobalRequest) => {
                self.handle_global_request(handler, payload).await?;
            }
            Some(MessageType::ChannelOpen) => {
                self.handle_channel_open(handler, payload).await?;
            }
            Some(MessageType::ChannelRequest) => {
                self.handle_channel_request(handler, payload).await?;
            }
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let channel = match self.channels.expect_mut(data.recipient_channel) {
                    Ok(channel) => channel,
                    Err(e) => {
                        let message = e.to_string();
                        return Err(self
                            .fail(
                                DisconnectReason::ProtocolError,
                                DisconnectLevel::Protocol,
                                &message,
                            )
                            .await);
                    }
                };
                if !channel.consume_local_window(data.data.len() as u32) {
                    return Err(self
                        .fail(
                            DisconnectReason::ProtocolError,
                            DisconnectLevel::Protocol,
                            "Channel data exceeds granted window",
                        )
                        .await);
                }
                handler.handle_data(data.recipient_channel, &data.data).await?;
                self.replenish_window(data.recipient_channel).await?;
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                if let Some(channel) = self.channels.get_mut(adjust.recipient_channel) {
                    channel.grow_remote_window(adjust.bytes_to_add);
                }
            }
            Some(MessageType::ChannelEof) => {
                let id = crate::ssh::connection::parse_channel_id(payload)?;
                if let Some(channel) = self.channels.get_mut(id) {
                    channel.note_remote_eof();
                }
            }
            Some(MessageType::ChannelClose) => {
                let id = crate::ssh::connection::parse_channel_id(payload)?;
                let (fully_closed, peer_id) = match self.channels.get_mut(id) {
                    Some(channel) => (channel.note_remote_close(), channel.peer_id.unwrap_or(id)),
                    None => return Ok(true),
                };
                if !fully_closed {
                    // Answer with our own CLOSE to finish the handshake.
                    let close = channel_id_message(MessageType::ChannelClose, peer_id);
                    self.transport.send_payload(&close).await?;
                    if let Some(channel) = self.channels.get_mut(id) {
                        channel.note_local_close();
                    }
                }
                self.channels.remove_closed(id);
            }
            Some(MessageType::ChannelSuccess) | Some(MessageType::ChannelFailure) => {
                // Replies to our own channel requests; nothing pending here.
            }
            Some(MessageType::RequestSuccess) | Some(MessageType::RequestFailure) => {
                // A keepalive probe answer; activity was already recorded.
            }
            Some(MessageType::Unimplemented) => {
                // The peer rejected something we sent; never answered, or
                // the two sides would ping-pong forever.
                warn!("peer reported an unimplemented message");
            }
            Some(MessageType::Disconnect) | Some(MessageType::Ignore)
            | Some(MessageType::Debug) => {
                // Consumed inside the transport; unreachable here.
            }
            _ => {
                let seq = self.transport.last_recv_seq();
                self.transport
                    .send_payload(&Transport::<S>::unimplemented_payload(seq))
                    .await?;
            }
        }
        Ok(true)
    }

    async fn replenish_window(&mut self, channel_id: u32) -> SkiffResult<()> {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return Ok(());
        };
        // Top the peer's budget back up once half the window is consumed.
        let deficit = self.config.window_size.saturating_sub(channel.local_window);
        if deficit >= self.config.window_size / 2 {
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

    async fn handle_global_request<H: SessionHandler>(
        &mut self,
        handler: &mut H,
        payload: &[u8],
    ) -> SkiffResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        let ticket = if request.want_reply {
            Some(self.global_replies.enqueue())
        } else {
            None
        };

        let reply: Vec<u8> = match &request.request {
            GlobalRequestType::TcpipForward { address, port } => {
                match handler.handle_tcpip_forward(address, *port).await {
                    Some(bound_port) => {
                        let mut w = WireWriter::new();
                        w.put_u8(MessageType::RequestSuccess as u8);
                        if *port == 0 {
                            w.put_u32(bound_port);
                        }
                        w.into_bytes()
                    }
                    None => vec![MessageType::RequestFailure as u8],
                }
            }
            GlobalRequestType::CancelTcpipForward { address, port } => {
                if handler.handle_cancel_tcpip_forward(address, *port).await {
                    vec![MessageType::RequestSuccess as u8]
                } else {
                    vec![MessageType::RequestFailure as u8]
                }
            }
            GlobalRequestType::StreamLocalForward { path }
            | GlobalRequestType::CancelStreamLocalForward { path } => {
                if handler.handle_streamlocal_forward(path).await {
                    vec![MessageType::RequestSuccess as u8]
                } else {
                    vec![MessageType::RequestFailure as u8]
                }
            }
            GlobalRequestType::NoMoreSessions => {
                self.no_more_sessions = true;
                vec![MessageType::RequestSuccess as u8]
            }
            GlobalRequestType::Unknown { name, .. } => {
                debug!(%name, "rejecting unknown global request");
                vec![MessageType::RequestFailure as u8]
            }
        };

        if let Some(ticket) = ticket {
            // Replies leave in arrival order even if resolved out of order.
            for ready in self.global_replies.resolve(ticket, reply) {
                self.transport.send_payload(&ready).await?;
            }
        }
        Ok(())
    }

    async fn handle_channel_open<H: SessionHandler>(
        &mut self,
        handler: &mut H,
        payload: &[u8],
    ) -> SkiffResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        let sender = open.sender_channel;

        if matches!(open.channel_type, ChannelType::Session) && self.no_more_sessions {
            let failure = ChannelOpenFailure::new(
                sender,
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "No more sessions",
            );
            return self.transport.send_payload(&failure.to_bytes()).await;
        }

        // Reserve the id before the handler runs so a second open arriving
        // while this one is pending acceptance can never take the slot.
        let local_id = match self
            .channels
            .reserve(self.config.window_size, self.config.max_packet_size)
        {
            Ok(id) => id,
            Err(_) => {
                let failure = ChannelOpenFailure::new(
                    sender,
                    ChannelOpenFailureReason::ResourceShortage,
                    "No free channel",
                );
                return self.transport.send_payload(&failure.to_bytes()).await;
            }
        };

        let accepted = match &open.channel_type {
            ChannelType::Session => true,
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                handler
                    .handle_direct_tcpip(host, *port, originator_address, *originator_port)
                    .await
            }
            _ => false,
        };

        if !accepted {
            debug!(channel_type = open.channel_type.name(), "rejecting channel open");
            self.channels.release(local_id);
            let failure = ChannelOpenFailure::new(
                sender,
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "Channel type not permitted",
            );
            return self.transport.send_payload(&failure.to_bytes()).await;
        }

        let channel = self.channels.get_mut(local_id).expect("just reserved");
        channel.confirm(sender, open.initial_window_size, open.maximum_packet_size);

        let confirmation = ChannelOpenConfirmation {
            recipient_channel: sender,
            sender_channel: local_id,
            initial_window_size: self.config.window_size,
            maximum_packet_size: self.config.max_packet_size,
        };
        self.transport.send_payload(&confirmation.to_bytes()).await
    }

    async fn handle_channel_request<H: SessionHandler>(
        &mut self,
        handler: &mut H,
        payload: &[u8],
    ) -> SkiffResult<()> {
        let request = ChannelRequest::from_bytes(payload)?;
        let local_id = request.recipient_channel;
        let peer_id = match self.channels.get(local_id).and_then(|c| c.peer_id) {
            Some(peer_id) => peer_id,
            None => {
                let message = format!("Request for unknown channel {}", local_id);
                return Err(self
                    .fail(
                        DisconnectReason::ProtocolError,
                        DisconnectLevel::Protocol,
                        &message,
                    )
                    .await);
            }
        };

        enum Outcome {
            Accept,
            Reject,
            /// Accepted with output to stream back (exec/shell).
            Output(Vec<u8>),
            /// Dropped without any reply.
            Silent,
        }

        let outcome = match &request.request {
            ChannelRequestType::Pty {
                term, cols, rows, ..
            } => {
                if handler.handle_pty(term, *cols, *rows).await {
                    Outcome::Accept
                } else {
                    Outcome::Reject
                }
            }
            ChannelRequestType::Env { name, value } => {
                handler.handle_env(name, value).await;
                Outcome::Silent
            }
            ChannelRequestType::WindowChange { cols, rows, .. } => {
                handler.handle_window_change(*cols, *rows).await;
                Outcome::Silent
            }
            ChannelRequestType::Signal { name } => {
                handler.handle_signal(name).await;
                Outcome::Silent
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                ..
            } => {
                if handler.handle_x11_req(*single_connection, auth_protocol).await {
                    Outcome::Accept
                } else {
                    Outcome::Reject
                }
            }
            ChannelRequestType::AuthAgentReq => {
                if handler.handle_auth_agent().await {
                    Outcome::Accept
                } else {
                    Outcome::Reject
                }
            }
            ChannelRequestType::Shell => match handler.handle_shell().await {
                Ok(output) => {
                    if let Some(channel) = self.channels.get_mut(local_id) {
                        channel.subtype = Some("shell".to_string());
                    }
                    Outcome::Output(output)
                }
                Err(_) => Outcome::Reject,
            },
            ChannelRequestType::Exec { command } => match handler.handle_exec(command).await {
                Ok(output) => {
                    if let Some(channel) = self.channels.get_mut(local_id) {
                        channel.subtype = Some("exec".to_string());
                    }
                    Outcome::Output(output)
                }
                Err(_) => Outcome::Reject,
            },
            ChannelRequestType::Subsystem { name } => {
                if handler.handle_subsystem(name).await {
                    if let Some(channel) = self.channels.get_mut(local_id) {
                        channel.subtype = Some(name.clone());
                    }
                    Outcome::Accept
                } else {
                    Outcome::Reject
                }
            }
            ChannelRequestType::ExitStatus { .. }
            | ChannelRequestType::ExitSignal { .. } => Outcome::Silent,
            ChannelRequestType::Unknown { name, .. } => {
                debug!(%name, "unhandled channel request");
                Outcome::Reject
            }
        };

        match outcome {
            Outcome::Silent => Ok(()),
            Outcome::Reject => {
                if request.want_reply {
                    let reply = channel_id_message(MessageType::ChannelFailure, peer_id);
                    self.transport.send_payload(&reply).await?;
                }
                Ok(())
            }
            Outcome::Accept => {
                if request.want_reply {
                    let reply = channel_id_message(MessageType::ChannelSuccess, peer_id);
                    self.transport.send_payload(&reply).await?;
                }
                Ok(())
            }
            Outcome::Output(output) => {
                if request.want_reply {
                    let reply = channel_id_message(MessageType::ChannelSuccess, peer_id);
                    self.transport.send_payload(&reply).await?;
                }
                self.stream_output_and_close(local_id, peer_id, output).await
            }
        }
    }

    /// Delivers command output, the exit status, EOF and CLOSE on a session
    /// channel.
    async fn stream_output_and_close(
        &mut self,
        local_id: u32,
        peer_id: u32,
        output: Vec<u8>,
    ) -> SkiffResult<()> {
        if !output.is_empty() {
            let len = output.len() as u32;
            let channel = self.channels.expect_mut(local_id)?;
            if !channel.consume_remote_window(len) {
                return Err(SkiffError::Protocol(
                    "Peer window too small for command output".to_string(),
                ));
            }
            let data = ChannelData {
                recipient_channel: peer_id,
                data: output,
            };
            self.transport.send_payload(&data.to_bytes()).await?;
        }

        let status = ChannelRequest {
            recipient_channel: peer_id,
            want_reply: false,
            request: ChannelRequestType::ExitStatus { status: 0 },
        };
        self.transport
            .send_payload(&status.encode(self.transport.peer_quirks()))
            .await?;

        self.transport
            .send_payload(&channel_id_message(MessageType::ChannelEof, peer_id))
            .await?;
        if let Some(channel) = self.channels.get_mut(local_id) {
            channel.note_local_eof();
        }

        self.transport
            .send_payload(&channel_id_message(MessageType::ChannelClose, peer_id))
            .await?;
        let fully_closed = self
            .channels
            .get_mut(local_id)
            .map(|c| c.note_local_close())
            .unwrap_or(false);
        if fully_closed {
            self.channels.remove_closed(local_id);
        }
        Ok(())
    }

    /// Closes the connection gracefully.
    pub async fn close(&mut self) -> SkiffResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_rejects_empty_host_keys() {
        let result = SshServer::bind(
            "127.0.0.1:0",
            SshServerConfig::default(),
            Vec::new(),
            Arc::new(DenyAllAuth),
        )
        .await;
        assert!(matches!(result, Err(SkiffError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_rejects_gex_in_server_kex_list() {
        let mut config = SshServerConfig::default();
        config.algorithms.kex = Some(vec![
            "diffie-hellman-group-exchange-sha256".to_string(),
        ]);
        let host_key: Arc<dyn HostKey> =
            Arc::new(crate::ssh::hostkey::EcdsaP256HostKey::generate().unwrap());
        let result =
            SshServer::bind("127.0.0.1:0", config, vec![host_key], Arc::new(DenyAllAuth)).await;
        assert!(matches!(result, Err(SkiffError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_rejects_unknown_cipher() {
        let mut config = SshServerConfig::default();
        config.algorithms.cipher = Some(vec!["rot13".to_string()]);
        let host_key: Arc<dyn HostKey> =
            Arc::new(crate::ssh::hostkey::EcdsaP256HostKey::generate().unwrap());
        let result =
            SshServer::bind("127.0.0.1:0", config, vec![host_key], Arc::new(DenyAllAuth)).await;
        assert!(matches!(result, Err(SkiffError::Config(_))));
    }
}
