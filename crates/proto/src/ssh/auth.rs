//! User authentication protocol (RFC 4252).
//!
//! Message codecs for the `ssh-userauth` service — none, password, public
//! key (probe and signed phases), host-based and keyboard-interactive — plus
//! the server-side [`AuthSequencer`] that owns the "one current context,
//! small bounded queue" state machine:
//!
//! - at most one [`AuthContext`] is current at a time
//! - requests arriving before the current context has produced any response
//!   are queued, up to [`MAX_PENDING_AUTH`]; overflow is a fatal protocol
//!   error
//! - a request arriving while a multi-step method (keyboard-interactive) is
//!   awaiting its next round silently aborts the current context (RFC 4252)
//! - a final accept stops all auth processing and drops the queue; a final
//!   reject promotes the next queued context
//!
//! The client side mirrors the flow with a pending-method queue that gives
//! packet types 60/61 their method-dependent meaning.

use crate::ssh::message::MessageType;
use crate::ssh::wire::{WireReader, WireWriter};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use zeroize::Zeroize;

/// Upper bound on queued-but-unanswered authentication contexts.
pub const MAX_PENDING_AUTH: usize = 10;

/// An authentication method with its method-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// The "none" method (used to probe available methods).
    None,
    /// Password authentication.
    Password {
        /// The plaintext password.
        password: String,
        /// New password for the change-password form, if present.
        new_password: Option<String>,
    },
    /// Public key authentication: probe phase when `signature` is `None`,
    /// signed phase otherwise.
    PublicKey {
        /// Public key algorithm name.
        algorithm: String,
        /// Public key blob.
        public_key: Vec<u8>,
        /// Signature blob (signed phase only).
        signature: Option<Vec<u8>>,
    },
    /// Host-based authentication.
    HostBased {
        /// Public key algorithm name.
        algorithm: String,
        /// Host public key blob.
        host_key: Vec<u8>,
        /// Client host name (FQDN).
        hostname: String,
        /// User name on the client host.
        local_user: String,
        /// Signature blob.
        signature: Vec<u8>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty).
        language: String,
        /// Comma-separated submethod hints.
        submethods: Vec<String>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::HostBased { .. } => "hostbased",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }

    /// Returns true for methods that may need several message rounds before
    /// a final verdict.
    pub fn is_multi_step(&self) -> bool {
        matches!(self, AuthMethod::KeyboardInteractive { .. })
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(np) = new_password {
                np.zeroize();
            }
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name to authenticate as.
    pub user_name: String,
    /// Service to start afterwards (normally "ssh-connection").
    pub service_name: String,
    /// The authentication method and its payload.
    pub method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::UserauthRequest as u8);
        w.put_string(self.user_name.as_bytes());
        w.put_string(self.service_name.as_bytes());
        w.put_string(self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                w.put_bool(new_password.is_some());
                w.put_string(password.as_bytes());
                if let Some(np) = new_password {
                    w.put_string(np.as_bytes());
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                w.put_bool(signature.is_some());
                w.put_string(algorithm.as_bytes());
                w.put_string(public_key);
                if let Some(sig) = signature {
                    w.put_string(sig);
                }
            }
            AuthMethod::HostBased {
                algorithm,
                host_key,
                hostname,
                local_user,
                signature,
            } => {
                w.put_string(algorithm.as_bytes());
                w.put_string(host_key);
                w.put_string(hostname.as_bytes());
                w.put_string(local_user.as_bytes());
                w.put_string(signature);
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                w.put_string(language.as_bytes());
                w.put_name_list(submethods);
            }
        }

        w.into_bytes()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] on a wrong message type, truncation,
    /// or an unknown method name.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_REQUEST".to_string());

        let msg_type = r.take_u8().ok_or_else(truncated)?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg_type
            )));
        }

        let user_name = r.take_utf8().ok_or_else(truncated)?;
        let service_name = r.take_utf8().ok_or_else(truncated)?;
        let method_name = r.take_utf8().ok_or_else(truncated)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = r.take_bool().ok_or_else(truncated)?;
                let password = r.take_utf8().ok_or_else(truncated)?;
                let new_password = if changing {
                    Some(r.take_utf8().ok_or_else(truncated)?)
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let signed = r.take_bool().ok_or_else(truncated)?;
                let algorithm = r.take_utf8().ok_or_else(truncated)?;
                let public_key = r.take_string().ok_or_else(truncated)?.to_vec();
                let signature = if signed {
                    Some(r.take_string().ok_or_else(truncated)?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "hostbased" => {
                let algorithm = r.take_utf8().ok_or_else(truncated)?;
                let host_key = r.take_string().ok_or_else(truncated)?.to_vec();
                let hostname = r.take_utf8().ok_or_else(truncated)?;
                let local_user = r.take_utf8().ok_or_else(truncated)?;
                let signature = r.take_string().ok_or_else(truncated)?.to_vec();
                AuthMethod::HostBased {
                    algorithm,
                    host_key,
                    hostname,
                    local_user,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let language = r.take_utf8().ok_or_else(truncated)?;
                let submethods = r.take_name_list().ok_or_else(truncated)?;
                AuthMethod::KeyboardInteractive {
                    language,
                    submethods,
                }
            }
            other => {
                return Err(SkiffError::Protocol(format!(
                    "Unknown authentication method: {}",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE: methods that can continue + partial-success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Authentications that may productively continue.
    pub methods: Vec<String>,
    /// True when the failed method actually succeeded but more are needed.
    pub partial_success: bool,
}

impl AuthFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::UserauthFailure as u8);
        w.put_name_list(&self.methods);
        w.put_bool(self.partial_success);
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_FAILURE".to_string());
        let msg_type = r.take_u8().ok_or_else(truncated)?;
        if msg_type != MessageType::UserauthFailure as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 51, got {}",
                msg_type
            )));
        }
        Ok(Self {
            methods: r.take_name_list().ok_or_else(truncated)?,
            partial_success: r.take_bool().ok_or_else(truncated)?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text shown to the user before authentication.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl AuthBanner {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::UserauthBanner as u8);
        w.put_string(self.message.as_bytes());
        w.put_string(self.language.as_bytes());
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_BANNER".to_string());
        let msg_type = r.take_u8().ok_or_else(truncated)?;
        if msg_type != MessageType::UserauthBanner as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 53, got {}",
                msg_type
            )));
        }
        Ok(Self {
            message: r.take_utf8().ok_or_else(truncated)?,
            language: r.take_utf8().ok_or_else(truncated)?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (type 60 while a publickey probe is outstanding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Echoed public key algorithm.
    pub algorithm: String,
    /// Echoed public key blob.
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(crate::ssh::message::auth_msg::METHOD_SPECIFIC_1);
        w.put_string(self.algorithm.as_bytes());
        w.put_string(&self.public_key);
        w.into_bytes()
    }

    /// Parses the message (caller has already matched the outstanding
    /// publickey method to type 60).
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_PK_OK".to_string());
        let _msg_type = r.take_u8().ok_or_else(truncated)?;
        Ok(Self {
            algorithm: r.take_utf8().ok_or_else(truncated)?,
            public_key: r.take_string().ok_or_else(truncated)?.to_vec(),
        })
    }
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPrompt {
    /// Prompt text.
    pub prompt: String,
    /// Whether the user's answer should be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (type 60 while keyboard-interactive is
/// outstanding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Round name.
    pub name: String,
    /// Instruction text.
    pub instruction: String,
    /// Language tag.
    pub language: String,
    /// Prompts for this round.
    pub prompts: Vec<InfoPrompt>,
}

impl InfoRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(crate::ssh::message::auth_msg::METHOD_SPECIFIC_1);
        w.put_string(self.name.as_bytes());
        w.put_string(self.instruction.as_bytes());
        w.put_string(self.language.as_bytes());
        w.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            w.put_string(prompt.prompt.as_bytes());
            w.put_bool(prompt.echo);
        }
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_INFO_REQUEST".to_string());
        let _msg_type = r.take_u8().ok_or_else(truncated)?;
        let name = r.take_utf8().ok_or_else(truncated)?;
        let instruction = r.take_utf8().ok_or_else(truncated)?;
        let language = r.take_utf8().ok_or_else(truncated)?;
        let count = r.take_u32().ok_or_else(truncated)? as usize;
        if count > 64 {
            return Err(SkiffError::Protocol(format!(
                "Unreasonable prompt count: {}",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(InfoPrompt {
                prompt: r.take_utf8().ok_or_else(truncated)?,
                echo: r.take_bool().ok_or_else(truncated)?,
            });
        }
        Ok(Self {
            name,
            instruction,
            language,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (type 61).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Answers, one per prompt, in order.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(crate::ssh::message::auth_msg::METHOD_SPECIFIC_2);
        w.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            w.put_string(response.as_bytes());
        }
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let truncated = || SkiffError::Protocol("Truncated USERAUTH_INFO_RESPONSE".to_string());
        let _msg_type = r.take_u8().ok_or_else(truncated)?;
        let count = r.take_u32().ok_or_else(truncated)? as usize;
        if count > 64 {
            return Err(SkiffError::Protocol(format!(
                "Unreasonable response count: {}",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(r.take_utf8().ok_or_else(truncated)?);
        }
        Ok(Self { responses })
    }
}

/// Builds the bytes a public-key signature covers (RFC 4252 Section 7):
/// the length-prefixed session identifier followed by the request fields up
/// to (excluding) the signature.
pub fn publickey_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(session_id);
    w.put_u8(MessageType::UserauthRequest as u8);
    w.put_string(user_name.as_bytes());
    w.put_string(service_name.as_bytes());
    w.put_string(b"publickey");
    w.put_bool(true);
    w.put_string(algorithm.as_bytes());
    w.put_string(public_key);
    w.into_bytes()
}

/// Builds the bytes a host-based signature covers (RFC 4252 Section 9).
pub fn hostbased_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    host_key: &[u8],
    hostname: &str,
    local_user: &str,
) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_string(session_id);
    w.put_u8(MessageType::UserauthRequest as u8);
    w.put_string(user_name.as_bytes());
    w.put_string(service_name.as_bytes());
    w.put_string(b"hostbased");
    w.put_string(algorithm.as_bytes());
    w.put_string(host_key);
    w.put_string(hostname.as_bytes());
    w.put_string(local_user.as_bytes());
    w.into_bytes()
}

/// One server-side authentication attempt.
#[derive(Debug)]
pub struct AuthContext {
    /// The parsed request.
    pub request: AuthRequest,
    /// True once this context has produced an initial (non-final) response,
    /// which only multi-step methods do.
    engaged: bool,
}

impl AuthContext {
    /// Wraps a parsed request.
    pub fn new(request: AuthRequest) -> Self {
        Self {
            request,
            engaged: false,
        }
    }
}

/// What [`AuthSequencer::push_request`] did with an incoming request.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// The request became the current context; dispatch it.
    BecameCurrent,
    /// The request was queued behind the current context.
    Queued,
    /// The current multi-step context was silently aborted and the request
    /// became current; dispatch it.
    AbortedCurrent,
}

/// Server-side authentication sequencing state.
#[derive(Debug, Default)]
pub struct AuthSequencer {
    current: Option<AuthContext>,
    queue: VecDeque<AuthContext>,
    authenticated: bool,
}

impl AuthSequencer {
    /// Creates an empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true after a final accept.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns the current context, if any.
    pub fn current(&self) -> Option<&AuthContext> {
        self.current.as_ref()
    }

    /// Accepts an incoming USERAUTH_REQUEST.
    ///
    /// # Errors
    ///
    /// - queue overflow beyond [`MAX_PENDING_AUTH`] (fatal protocol error)
    /// - any request after a final accept (the server has stopped listening)
    pub fn push_request(&mut self, request: AuthRequest) -> SkiffResult<PushOutcome> {
        if self.authenticated {
            return Err(SkiffError::Protocol(
                "USERAUTH_REQUEST after successful authentication".to_string(),
            ));
        }

        match &self.current {
            None => {
                self.current = Some(AuthContext::new(request));
                Ok(PushOutcome::BecameCurrent)
            }
            Some(current) if current.engaged => {
                // RFC 4252: a conflicting request aborts an in-flight
                // multi-step exchange without a response.
                self.current = Some(AuthContext::new(request));
                Ok(PushOutcome::AbortedCurrent)
            }
            Some(_) => {
                if self.queue.len() >= MAX_PENDING_AUTH {
                    return Err(SkiffError::Protocol(format!(
                        "Authentication request queue exceeded {} entries",
                        MAX_PENDING_AUTH
                    )));
                }
                self.queue.push_back(AuthContext::new(request));
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Marks the current context as having produced an initial response
    /// (an INFO_REQUEST round, a PK_OK probe answer does not count — probes
    /// resolve immediately).
    pub fn mark_engaged(&mut self) {
        if let Some(current) = &mut self.current {
            current.engaged = true;
        }
    }

    /// Records the final verdict for the current context.
    ///
    /// Accept: authentication is complete, the queue is dropped. Reject:
    /// the next queued context (if any) is promoted and returned so the
    /// caller can dispatch it.
    pub fn resolve_current(&mut self, accepted: bool) -> Option<&AuthContext> {
        self.current = None;
        if accepted {
            self.authenticated = true;
            self.queue.clear();
            None
        } else {
            self.current = self.queue.pop_front();
            self.current.as_ref()
        }
    }

    /// Completes the current context without a verdict (the PK_OK answer to
    /// a public-key probe): no failure is sent and the queue is not
    /// consumed beyond promoting the next context.
    pub fn complete_current(&mut self) -> Option<&AuthContext> {
        self.current = self.queue.pop_front();
        self.current.as_ref()
    }

    /// Number of queued (not current) contexts.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Client-side queue of issued-but-unanswered method names, used to give
/// packet types 60/61 their meaning.
#[derive(Debug, Default)]
pub struct PendingMethods {
    methods: VecDeque<&'static str>,
}

impl PendingMethods {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issued request's method.
    pub fn push(&mut self, method: &'static str) {
        self.methods.push_back(method);
    }

    /// Returns the method awaiting a response.
    pub fn outstanding(&self) -> Option<&'static str> {
        self.methods.front().copied()
    }

    /// Pops the method that just received its final response.
    pub fn resolve(&mut self) -> Option<&'static str> {
        self.methods.pop_front()
    }
}

/// Constant-time byte comparison for password checks.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(request: AuthRequest) {
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 50);
        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_round_trip_all_methods() {
        round_trip(AuthRequest::new("alice", "ssh-connection", AuthMethod::None));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password {
                password: "secret".to_string(),
                new_password: None,
            },
        ));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password {
                password: "old".to_string(),
                new_password: Some("new".to_string()),
            },
        ));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-rsa".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        ));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-rsa".to_string(),
                public_key: vec![1, 2, 3],
                signature: Some(vec![4, 5, 6]),
            },
        ));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::HostBased {
                algorithm: "ssh-rsa".to_string(),
                host_key: vec![9, 9],
                hostname: "client.example".to_string(),
                local_user: "bob".to_string(),
                signature: vec![7],
            },
        ));
        round_trip(AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: vec!["otp".to_string()],
            },
        ));
    }

    #[test]
    fn test_request_unknown_method() {
        let mut w = WireWriter::new();
        w.put_u8(50);
        w.put_string(b"alice");
        w.put_string(b"ssh-connection");
        w.put_string(b"telepathy");
        assert!(AuthRequest::from_bytes(&w.into_bytes()).is_err());
    }

    #[test]
    fn test_failure_round_trip() {
        let failure = AuthFailure {
            methods: vec!["password".to_string(), "publickey".to_string()],
            partial_success: true,
        };
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_banner_and_pk_ok_round_trip() {
        let banner = AuthBanner {
            message: "welcome".to_string(),
            language: "en".to_string(),
        };
        assert_eq!(AuthBanner::from_bytes(&banner.to_bytes()).unwrap(), banner);

        let pk_ok = AuthPkOk {
            algorithm: "ssh-rsa".to_string(),
            public_key: vec![1, 2, 3],
        };
        assert_eq!(AuthPkOk::from_bytes(&pk_ok.to_bytes()).unwrap(), pk_ok);
    }

    #[test]
    fn test_info_request_response_round_trip() {
        let request = InfoRequest {
            name: "Second factor".to_string(),
            instruction: "Enter your code".to_string(),
            language: String::new(),
            prompts: vec![
                InfoPrompt {
                    prompt: "Code: ".to_string(),
                    echo: false,
                },
                InfoPrompt {
                    prompt: "Color? ".to_string(),
                    echo: true,
                },
            ],
        };
        assert_eq!(InfoRequest::from_bytes(&request.to_bytes()).unwrap(), request);

        let response = InfoResponse {
            responses: vec!["123456".to_string(), "green".to_string()],
        };
        assert_eq!(
            InfoResponse::from_bytes(&response.to_bytes()).unwrap(),
            response
        );
    }

    #[test]
    fn test_signature_data_layout() {
        let data = publickey_signature_data(b"sid", "alice", "ssh-connection", "ssh-rsa", b"blob");
        // string "sid"
        assert_eq!(&data[..7], &[0, 0, 0, 3, b's', b'i', b'd']);
        // then the request byte
        assert_eq!(data[7], 50);
    }

    fn none_request() -> AuthRequest {
        AuthRequest::new("alice", "ssh-connection", AuthMethod::None)
    }

    fn kbd_request() -> AuthRequest {
        AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: vec![],
            },
        )
    }

    #[test]
    fn test_sequencer_queue_cap() {
        let mut seq = AuthSequencer::new();
        assert_eq!(seq.push_request(none_request()).unwrap(), PushOutcome::BecameCurrent);

        for _ in 0..MAX_PENDING_AUTH {
            assert_eq!(seq.push_request(none_request()).unwrap(), PushOutcome::Queued);
        }
        // Request 12 overflows the bound.
        assert!(seq.push_request(none_request()).is_err());
        assert_eq!(seq.queued(), MAX_PENDING_AUTH);
    }

    #[test]
    fn test_sequencer_silent_abort_of_multi_step() {
        let mut seq = AuthSequencer::new();
        seq.push_request(kbd_request()).unwrap();
        seq.mark_engaged();

        // A conflicting request replaces the engaged context silently.
        assert_eq!(
            seq.push_request(none_request()).unwrap(),
            PushOutcome::AbortedCurrent
        );
        assert_eq!(seq.current().unwrap().request.method.name(), "none");
    }

    #[test]
    fn test_sequencer_accept_clears_queue_and_stops() {
        let mut seq = AuthSequencer::new();
        seq.push_request(none_request()).unwrap();
        seq.push_request(none_request()).unwrap();
        assert_eq!(seq.queued(), 1);

        assert!(seq.resolve_current(true).is_none());
        assert!(seq.is_authenticated());
        assert_eq!(seq.queued(), 0);

        // Further requests are a protocol error.
        assert!(seq.push_request(none_request()).is_err());
    }

    #[test]
    fn test_sequencer_probe_completion_without_verdict() {
        let mut seq = AuthSequencer::new();
        seq.push_request(none_request()).unwrap();
        seq.push_request(kbd_request()).unwrap();

        // A PK_OK-style completion consumes no verdict: not authenticated,
        // no failure recorded, next context promoted.
        let promoted = seq.complete_current().unwrap();
        assert_eq!(promoted.request.method.name(), "keyboard-interactive");
        assert!(!seq.is_authenticated());
        assert_eq!(seq.queued(), 0);
    }

    #[test]
    fn test_sequencer_reject_promotes_next() {
        let mut seq = AuthSequencer::new();
        seq.push_request(none_request()).unwrap();
        seq.push_request(kbd_request()).unwrap();

        let promoted = seq.resolve_current(false).unwrap();
        assert_eq!(promoted.request.method.name(), "keyboard-interactive");
        assert!(!seq.is_authenticated());

        assert!(seq.resolve_current(false).is_none());
        assert!(seq.current().is_none());
    }

    #[test]
    fn test_pending_methods_disambiguation() {
        let mut pending = PendingMethods::new();
        pending.push("publickey");
        pending.push("keyboard-interactive");

        // Type 60 means PK_OK while publickey is outstanding.
        assert_eq!(pending.outstanding(), Some("publickey"));
        pending.resolve();
        // Then the same type 60 means INFO_REQUEST.
        assert_eq!(pending.outstanding(), Some("keyboard-interactive"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"same", b"same"));
        assert!(!constant_time_compare(b"same", b"diff"));
        assert!(!constant_time_compare(b"same", b"longer"));
    }
}
