//! Connection protocol messages (RFC 4254).
//!
//! Channel lifecycle (open/confirm/fail/close), flow-controlled data
//! transfer, channel requests and global requests. Request names are closed
//! enums with an explicit `Unknown` variant carrying the raw bytes, so
//! unrecognized requests flow through to the auto-reject/auto-UNIMPLEMENTED
//! paths instead of being dropped in the parser.

use crate::ssh::message::{ChannelOpenFailureReason, MessageType};
use crate::ssh::version::PeerQuirks;
use crate::ssh::wire::{WireReader, WireWriter};
use skiff_platform::{SkiffError, SkiffResult};

/// Default per-channel receive window (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum channel packet size (32 KB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Upper bound accepted for a peer's initial window size (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Upper bound accepted for a peer's maximum packet size (256 KB).
pub const MAX_CHANNEL_PACKET_SIZE: u32 = 256 * 1024;

fn truncated(what: &'static str) -> impl Fn() -> SkiffError {
    move || SkiffError::Protocol(format!("Truncated {}", what))
}

fn check_type(r: &mut WireReader<'_>, expected: MessageType) -> SkiffResult<()> {
    match r.take_u8() {
        Some(b) if b == expected as u8 => Ok(()),
        Some(b) => Err(SkiffError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected as u8,
            expected.name(),
            b
        ))),
        None => Err(SkiffError::Protocol("Empty message".to_string())),
    }
}

/// Channel open type with its type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Interactive session channel.
    Session,
    /// Outbound TCP/IP forwarding (client asks server to connect out).
    DirectTcpip {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u32,
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// Outbound Unix-socket forwarding (`direct-streamlocal@openssh.com`).
    DirectStreamLocal {
        /// Socket path to connect to.
        path: String,
    },
    /// X11 forwarding connection.
    X11 {
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// Inbound forwarded TCP/IP connection.
    ForwardedTcpip {
        /// Address the connection arrived on.
        connected_address: String,
        /// Port the connection arrived on.
        connected_port: u32,
        /// Originator address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// Inbound forwarded Unix-socket connection
    /// (`forwarded-streamlocal@openssh.com`).
    ForwardedStreamLocal {
        /// Socket path the connection arrived on.
        path: String,
    },
    /// Unrecognized channel type, raw payload preserved.
    Unknown {
        /// Channel type name.
        name: String,
        /// Type-specific payload bytes.
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::DirectStreamLocal { .. } => "direct-streamlocal@openssh.com",
            ChannelType::X11 { .. } => "x11",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::ForwardedStreamLocal { .. } => "forwarded-streamlocal@openssh.com",
            ChannelType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and payload.
    pub channel_type: ChannelType,
    /// Sender's channel id.
    pub sender_channel: u32,
    /// Initial window size granted to the peer.
    pub initial_window_size: u32,
    /// Maximum packet size the peer may send.
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates an open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::ChannelOpen as u8);
        w.put_string(self.channel_type.name().as_bytes());
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window_size);
        w.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                w.put_string(host.as_bytes());
                w.put_u32(*port);
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::DirectStreamLocal { path } => {
                w.put_string(path.as_bytes());
                // Reserved fields the OpenSSH extension carries.
                w.put_string(b"");
                w.put_u32(0);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                w.put_string(connected_address.as_bytes());
                w.put_u32(*connected_port);
                w.put_string(originator_address.as_bytes());
                w.put_u32(*originator_port);
            }
            ChannelType::ForwardedStreamLocal { path } => {
                w.put_string(path.as_bytes());
                w.put_string(b"");
            }
            ChannelType::Unknown { data, .. } => {
                w.put_raw(data);
            }
        }

        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_OPEN");
        check_type(&mut r, MessageType::ChannelOpen)?;

        let type_name = r.take_utf8().ok_or_else(&err)?;
        let sender_channel = r.take_u32().ok_or_else(&err)?;
        let initial_window_size = r.take_u32().ok_or_else(&err)?;
        let maximum_packet_size = r.take_u32().ok_or_else(&err)?;

        if initial_window_size > MAX_WINDOW_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Initial window size {} exceeds maximum {}",
                initial_window_size, MAX_WINDOW_SIZE
            )));
        }
        if maximum_packet_size > MAX_CHANNEL_PACKET_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Maximum packet size {} exceeds maximum {}",
                maximum_packet_size, MAX_CHANNEL_PACKET_SIZE
            )));
        }

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.take_utf8().ok_or_else(&err)?,
                port: r.take_u32().ok_or_else(&err)?,
                originator_address: r.take_utf8().ok_or_else(&err)?,
                originator_port: r.take_u32().ok_or_else(&err)?,
            },
            "direct-streamlocal@openssh.com" => ChannelType::DirectStreamLocal {
                path: r.take_utf8().ok_or_else(&err)?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.take_utf8().ok_or_else(&err)?,
                originator_port: r.take_u32().ok_or_else(&err)?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.take_utf8().ok_or_else(&err)?,
                connected_port: r.take_u32().ok_or_else(&err)?,
                originator_address: r.take_utf8().ok_or_else(&err)?,
                originator_port: r.take_u32().ok_or_else(&err)?,
            },
            "forwarded-streamlocal@openssh.com" => ChannelType::ForwardedStreamLocal {
                path: r.take_utf8().ok_or_else(&err)?,
            },
            _ => ChannelType::Unknown {
                name: type_name,
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// The confirmer's channel id.
    pub sender_channel: u32,
    /// Window granted to the opener.
    pub initial_window_size: u32,
    /// Maximum packet size the opener may send.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(17);
        w.put_u8(MessageType::ChannelOpenConfirmation as u8);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.sender_channel);
        w.put_u32(self.initial_window_size);
        w.put_u32(self.maximum_packet_size);
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_OPEN_CONFIRMATION");
        check_type(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.take_u32().ok_or_else(&err)?,
            sender_channel: r.take_u32().ok_or_else(&err)?,
            initial_window_size: r.take_u32().ok_or_else(&err)?,
            maximum_packet_size: r.take_u32().ok_or_else(&err)?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// The opener's channel id.
    pub recipient_channel: u32,
    /// Failure reason code.
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl ChannelOpenFailure {
    /// Creates a failure message.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason, description: &str) -> Self {
        Self {
            recipient_channel,
            reason,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::ChannelOpenFailure as u8);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.reason as u32);
        w.put_string(self.description.as_bytes());
        w.put_string(self.language.as_bytes());
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_OPEN_FAILURE");
        check_type(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.take_u32().ok_or_else(&err)?;
        let code = r.take_u32().ok_or_else(&err)?;
        let reason = ChannelOpenFailureReason::from_u32(code).unwrap_or(
            ChannelOpenFailureReason::AdministrativelyProhibited,
        );
        Ok(Self {
            recipient_channel,
            reason,
            description: r.take_utf8().ok_or_else(&err)?,
            language: r.take_utf8().ok_or_else(&err)?,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// The peer's channel id.
    pub recipient_channel: u32,
    /// Bytes added to the peer's send budget.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(9);
        w.put_u8(MessageType::ChannelWindowAdjust as u8);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.bytes_to_add);
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_WINDOW_ADJUST");
        check_type(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.take_u32().ok_or_else(&err)?,
            bytes_to_add: r.take_u32().ok_or_else(&err)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// The peer's channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(9 + self.data.len());
        w.put_u8(MessageType::ChannelData as u8);
        w.put_u32(self.recipient_channel);
        w.put_string(&self.data);
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_DATA");
        check_type(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.take_u32().ok_or_else(&err)?,
            data: r.take_string().ok_or_else(&err)?.to_vec(),
        })
    }
}

/// Extended data stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedDataType {
    /// stderr (SSH_EXTENDED_DATA_STDERR).
    Stderr,
    /// Any other stream code.
    Other(u32),
}

impl ExtendedDataType {
    /// Wire code.
    pub fn code(&self) -> u32 {
        match self {
            ExtendedDataType::Stderr => 1,
            ExtendedDataType::Other(code) => *code,
        }
    }

    /// From wire code.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ExtendedDataType::Stderr,
            other => ExtendedDataType::Other(other),
        }
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// The peer's channel id.
    pub recipient_channel: u32,
    /// Stream type (stderr).
    pub data_type: ExtendedDataType,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(13 + self.data.len());
        w.put_u8(MessageType::ChannelExtendedData as u8);
        w.put_u32(self.recipient_channel);
        w.put_u32(self.data_type.code());
        w.put_string(&self.data);
        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_EXTENDED_DATA");
        check_type(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.take_u32().ok_or_else(&err)?,
            data_type: ExtendedDataType::from_code(r.take_u32().ok_or_else(&err)?),
            data: r.take_string().ok_or_else(&err)?.to_vec(),
        })
    }
}

/// A channel request name with its payload (RFC 4254 Sections 6.2-6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Request a pseudo-terminal.
    Pty {
        /// TERM environment value.
        term: String,
        /// Terminal width, characters.
        cols: u32,
        /// Terminal height, rows.
        rows: u32,
        /// Terminal width, pixels.
        width_px: u32,
        /// Terminal height, pixels.
        height_px: u32,
        /// Encoded terminal modes.
        modes: Vec<u8>,
    },
    /// Request X11 forwarding for the session.
    X11Req {
        /// Only one connection should be forwarded.
        single_connection: bool,
        /// Authentication protocol name.
        auth_protocol: String,
        /// Authentication cookie (hex).
        auth_cookie: String,
        /// X11 screen number.
        screen: u32,
    },
    /// Pass an environment variable.
    Env {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Start the user's shell.
    Shell,
    /// Execute a command.
    Exec {
        /// Command line.
        command: String,
    },
    /// Start a named subsystem (e.g., `sftp`).
    Subsystem {
        /// Subsystem name.
        name: String,
    },
    /// Terminal dimensions changed.
    WindowChange {
        /// Terminal width, characters.
        cols: u32,
        /// Terminal height, rows.
        rows: u32,
        /// Terminal width, pixels.
        width_px: u32,
        /// Terminal height, pixels.
        height_px: u32,
    },
    /// Deliver a signal to the remote process.
    Signal {
        /// Signal name without the "SIG" prefix.
        name: String,
    },
    /// Remote process exit status.
    ExitStatus {
        /// Exit status.
        status: u32,
    },
    /// Remote process terminated by signal.
    ExitSignal {
        /// Signal name without the "SIG" prefix.
        name: String,
        /// Whether a core dump was produced.
        core_dumped: bool,
        /// Error message.
        message: String,
        /// Language tag.
        language: String,
    },
    /// Request agent forwarding (`auth-agent-req@openssh.com`).
    AuthAgentReq,
    /// Unrecognized request, raw payload preserved.
    Unknown {
        /// Request name.
        name: String,
        /// Payload bytes.
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Pty { .. } => "pty-req",
            ChannelRequestType::X11Req { .. } => "x11-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::AuthAgentReq => "auth-agent-req@openssh.com",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }
}

/// Maps a signal name (no "SIG" prefix) to the pre-standard numeric
/// encoding some old peers expect in exit-signal.
pub fn signal_number(name: &str) -> u32 {
    match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "SEGV" => 11,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "USR1" => 30,
        "USR2" => 31,
        _ => 0,
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// The peer's channel id.
    pub recipient_channel: u32,
    /// Whether the peer expects SUCCESS/FAILURE.
    pub want_reply: bool,
    /// The request and its payload.
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(PeerQuirks::default())
    }

    /// Serializes the message, honoring peer quirks (legacy numeric
    /// exit-signal encoding).
    pub fn encode(&self, quirks: PeerQuirks) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::ChannelRequest as u8);
        w.put_u32(self.recipient_channel);
        w.put_string(self.request.name().as_bytes());
        w.put_bool(self.want_reply);

        match &self.request {
            ChannelRequestType::Pty {
                term,
                cols,
                rows,
                width_px,
                height_px,
                modes,
            } => {
                w.put_string(term.as_bytes());
                w.put_u32(*cols);
                w.put_u32(*rows);
                w.put_u32(*width_px);
                w.put_u32(*height_px);
                w.put_string(modes);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen,
            } => {
                w.put_bool(*single_connection);
                w.put_string(auth_protocol.as_bytes());
                w.put_string(auth_cookie.as_bytes());
                w.put_u32(*screen);
            }
            ChannelRequestType::Env { name, value } => {
                w.put_string(name.as_bytes());
                w.put_string(value.as_bytes());
            }
            ChannelRequestType::Shell | ChannelRequestType::AuthAgentReq => {}
            ChannelRequestType::Exec { command } => {
                w.put_string(command.as_bytes());
            }
            ChannelRequestType::Subsystem { name } => {
                w.put_string(name.as_bytes());
            }
            ChannelRequestType::WindowChange {
                cols,
                rows,
                width_px,
                height_px,
            } => {
                w.put_u32(*cols);
                w.put_u32(*rows);
                w.put_u32(*width_px);
                w.put_u32(*height_px);
            }
            ChannelRequestType::Signal { name } => {
                w.put_string(name.as_bytes());
            }
            ChannelRequestType::ExitStatus { status } => {
                w.put_u32(*status);
            }
            ChannelRequestType::ExitSignal {
                name,
                core_dumped,
                message,
                language,
            } => {
                if quirks.legacy_exit_signal {
                    w.put_u32(signal_number(name));
                } else {
                    w.put_string(name.as_bytes());
                }
                w.put_bool(*core_dumped);
                w.put_string(message.as_bytes());
                w.put_string(language.as_bytes());
            }
            ChannelRequestType::Unknown { data, .. } => {
                w.put_raw(data);
            }
        }

        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("CHANNEL_REQUEST");
        check_type(&mut r, MessageType::ChannelRequest)?;

        let recipient_channel = r.take_u32().ok_or_else(&err)?;
        let name = r.take_utf8().ok_or_else(&err)?;
        let want_reply = r.take_bool().ok_or_else(&err)?;

        let request = match name.as_str() {
            "pty-req" => ChannelRequestType::Pty {
                term: r.take_utf8().ok_or_else(&err)?,
                cols: r.take_u32().ok_or_else(&err)?,
                rows: r.take_u32().ok_or_else(&err)?,
                width_px: r.take_u32().ok_or_else(&err)?,
                height_px: r.take_u32().ok_or_else(&err)?,
                modes: r.take_string().ok_or_else(&err)?.to_vec(),
            },
            "x11-req" => ChannelRequestType::X11Req {
                single_connection: r.take_bool().ok_or_else(&err)?,
                auth_protocol: r.take_utf8().ok_or_else(&err)?,
                auth_cookie: r.take_utf8().ok_or_else(&err)?,
                screen: r.take_u32().ok_or_else(&err)?,
            },
            "env" => ChannelRequestType::Env {
                name: r.take_utf8().ok_or_else(&err)?,
                value: r.take_utf8().ok_or_else(&err)?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: r.take_utf8().ok_or_else(&err)?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.take_utf8().ok_or_else(&err)?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                cols: r.take_u32().ok_or_else(&err)?,
                rows: r.take_u32().ok_or_else(&err)?,
                width_px: r.take_u32().ok_or_else(&err)?,
                height_px: r.take_u32().ok_or_else(&err)?,
            },
            "signal" => ChannelRequestType::Signal {
                name: r.take_utf8().ok_or_else(&err)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                status: r.take_u32().ok_or_else(&err)?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                name: r.take_utf8().ok_or_else(&err)?,
                core_dumped: r.take_bool().ok_or_else(&err)?,
                message: r.take_utf8().ok_or_else(&err)?,
                language: r.take_utf8().ok_or_else(&err)?,
            },
            "auth-agent-req@openssh.com" => ChannelRequestType::AuthAgentReq,
            _ => ChannelRequestType::Unknown {
                name,
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// A global request name with its payload (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Listen for inbound TCP connections on the peer.
    TcpipForward {
        /// Address to bind.
        address: String,
        /// Port to bind (0 = peer chooses).
        port: u32,
    },
    /// Stop a previously requested TCP listen.
    CancelTcpipForward {
        /// Bound address.
        address: String,
        /// Bound port.
        port: u32,
    },
    /// Listen on a Unix socket (`streamlocal-forward@openssh.com`).
    StreamLocalForward {
        /// Socket path.
        path: String,
    },
    /// Stop a Unix socket listen.
    CancelStreamLocalForward {
        /// Socket path.
        path: String,
    },
    /// No more session channels will be opened
    /// (`no-more-sessions@openssh.com`).
    NoMoreSessions,
    /// Unrecognized request, raw payload preserved (covers keepalive
    /// probes, which count on a reply of either flavor).
    Unknown {
        /// Request name.
        name: String,
        /// Payload bytes.
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::StreamLocalForward { .. } => "streamlocal-forward@openssh.com",
            GlobalRequestType::CancelStreamLocalForward { .. } => {
                "cancel-streamlocal-forward@openssh.com"
            }
            GlobalRequestType::NoMoreSessions => "no-more-sessions@openssh.com",
            GlobalRequestType::Unknown { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether the peer expects REQUEST_SUCCESS/FAILURE.
    pub want_reply: bool,
    /// The request and its payload.
    pub request: GlobalRequestType,
}

impl GlobalRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(MessageType::GlobalRequest as u8);
        w.put_string(self.request.name().as_bytes());
        w.put_bool(self.want_reply);

        match &self.request {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                w.put_string(address.as_bytes());
                w.put_u32(*port);
            }
            GlobalRequestType::StreamLocalForward { path }
            | GlobalRequestType::CancelStreamLocalForward { path } => {
                w.put_string(path.as_bytes());
            }
            GlobalRequestType::NoMoreSessions => {}
            GlobalRequestType::Unknown { data, .. } => {
                w.put_raw(data);
            }
        }

        w.into_bytes()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut r = WireReader::new(data);
        let err = truncated("GLOBAL_REQUEST");
        check_type(&mut r, MessageType::GlobalRequest)?;

        let name = r.take_utf8().ok_or_else(&err)?;
        let want_reply = r.take_bool().ok_or_else(&err)?;

        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: r.take_utf8().ok_or_else(&err)?,
                port: r.take_u32().ok_or_else(&err)?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: r.take_utf8().ok_or_else(&err)?,
                port: r.take_u32().ok_or_else(&err)?,
            },
            "streamlocal-forward@openssh.com" => GlobalRequestType::StreamLocalForward {
                path: r.take_utf8().ok_or_else(&err)?,
            },
            "cancel-streamlocal-forward@openssh.com" => {
                GlobalRequestType::CancelStreamLocalForward {
                    path: r.take_utf8().ok_or_else(&err)?,
                }
            }
            "no-more-sessions@openssh.com" => GlobalRequestType::NoMoreSessions,
            _ => GlobalRequestType::Unknown {
                name,
                data: r.rest().to_vec(),
            },
        };

        Ok(Self {
            want_reply,
            request,
        })
    }
}

/// Builds a simple channel-id message (EOF, CLOSE, SUCCESS, FAILURE).
pub fn channel_id_message(msg_type: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(5);
    w.put_u8(msg_type as u8);
    w.put_u32(recipient_channel);
    w.into_bytes()
}

/// Parses a simple channel-id message body, returning the channel id.
pub fn parse_channel_id(data: &[u8]) -> SkiffResult<u32> {
    let mut r = WireReader::new(data);
    let _type = r
        .take_u8()
        .ok_or_else(|| SkiffError::Protocol("Empty channel message".to_string()))?;
    r.take_u32()
        .ok_or_else(|| SkiffError::Protocol("Truncated channel message".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session_round_trip() {
        let open = ChannelOpen::new(ChannelType::Session, 3, DEFAULT_WINDOW_SIZE, DEFAULT_MAX_PACKET_SIZE);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_channel_open_direct_tcpip_round_trip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "internal.example".to_string(),
                port: 8080,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 52000,
            },
            0,
            DEFAULT_WINDOW_SIZE,
            DEFAULT_MAX_PACKET_SIZE,
        );
        assert_eq!(ChannelOpen::from_bytes(&open.to_bytes()).unwrap(), open);
    }

    #[test]
    fn test_channel_open_unknown_type_preserved() {
        let open = ChannelOpen::new(
            ChannelType::Unknown {
                name: "tun@openssh.com".to_string(),
                data: vec![0, 0, 0, 1, 0, 0, 0, 0],
            },
            1,
            1024,
            1024,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_channel_open_rejects_oversized_window() {
        let open = ChannelOpen::new(ChannelType::Session, 0, MAX_WINDOW_SIZE, 1024);
        let mut bytes = open.to_bytes();
        // Bump the window size field beyond the bound.
        let pos = bytes.len() - 8;
        bytes[pos..pos + 4].copy_from_slice(&(MAX_WINDOW_SIZE + 1).to_be_bytes());
        assert!(ChannelOpen::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_open_confirmation_and_failure_round_trip() {
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: 1,
            sender_channel: 2,
            initial_window_size: 4096,
            maximum_packet_size: 1024,
        };
        assert_eq!(
            ChannelOpenConfirmation::from_bytes(&confirmation.to_bytes()).unwrap(),
            confirmation
        );

        let failure = ChannelOpenFailure::new(
            7,
            ChannelOpenFailureReason::ResourceShortage,
            "no free channels",
        );
        assert_eq!(
            ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap(),
            failure
        );
    }

    #[test]
    fn test_data_messages_round_trip() {
        let data = ChannelData {
            recipient_channel: 4,
            data: b"hello".to_vec(),
        };
        assert_eq!(ChannelData::from_bytes(&data.to_bytes()).unwrap(), data);

        let ext = ChannelExtendedData {
            recipient_channel: 4,
            data_type: ExtendedDataType::Stderr,
            data: b"oops".to_vec(),
        };
        assert_eq!(
            ChannelExtendedData::from_bytes(&ext.to_bytes()).unwrap(),
            ext
        );

        let adjust = ChannelWindowAdjust {
            recipient_channel: 4,
            bytes_to_add: 32768,
        };
        assert_eq!(
            ChannelWindowAdjust::from_bytes(&adjust.to_bytes()).unwrap(),
            adjust
        );
    }

    #[test]
    fn test_channel_request_round_trips() {
        let requests = vec![
            ChannelRequestType::Pty {
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
                width_px: 0,
                height_px: 0,
                modes: vec![0],
            },
            ChannelRequestType::Env {
                name: "LANG".to_string(),
                value: "C.UTF-8".to_string(),
            },
            ChannelRequestType::Shell,
            ChannelRequestType::Exec {
                command: "echo hi".to_string(),
            },
            ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            },
            ChannelRequestType::WindowChange {
                cols: 120,
                rows: 40,
                width_px: 0,
                height_px: 0,
            },
            ChannelRequestType::Signal {
                name: "TERM".to_string(),
            },
            ChannelRequestType::ExitStatus { status: 0 },
            ChannelRequestType::ExitSignal {
                name: "KILL".to_string(),
                core_dumped: false,
                message: String::new(),
                language: String::new(),
            },
            ChannelRequestType::AuthAgentReq,
            ChannelRequestType::X11Req {
                single_connection: false,
                auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
                auth_cookie: "abcd".to_string(),
                screen: 0,
            },
            ChannelRequestType::Unknown {
                name: "eow@openssh.com".to_string(),
                data: vec![],
            },
        ];

        for request in requests {
            let msg = ChannelRequest {
                recipient_channel: 9,
                want_reply: true,
                request,
            };
            let parsed = ChannelRequest::from_bytes(&msg.to_bytes()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn test_exit_signal_legacy_encoding() {
        let msg = ChannelRequest {
            recipient_channel: 0,
            want_reply: false,
            request: ChannelRequestType::ExitSignal {
                name: "TERM".to_string(),
                core_dumped: false,
                message: String::new(),
                language: String::new(),
            },
        };

        let quirks = PeerQuirks {
            legacy_exit_signal: true,
            ..PeerQuirks::default()
        };
        let legacy = msg.encode(quirks);
        let modern = msg.to_bytes();
        assert_ne!(legacy, modern);

        // The legacy form carries uint32 15 where the name string would be.
        let name_offset = 1 + 4 + 4 + "exit-signal".len() + 1;
        assert_eq!(
            &legacy[name_offset..name_offset + 4],
            &15u32.to_be_bytes()
        );
    }

    #[test]
    fn test_global_request_round_trips() {
        let requests = vec![
            GlobalRequestType::TcpipForward {
                address: "0.0.0.0".to_string(),
                port: 8022,
            },
            GlobalRequestType::CancelTcpipForward {
                address: "0.0.0.0".to_string(),
                port: 8022,
            },
            GlobalRequestType::StreamLocalForward {
                path: "/tmp/agent.sock".to_string(),
            },
            GlobalRequestType::CancelStreamLocalForward {
                path: "/tmp/agent.sock".to_string(),
            },
            GlobalRequestType::NoMoreSessions,
            GlobalRequestType::Unknown {
                name: "keepalive@openssh.com".to_string(),
                data: vec![],
            },
        ];

        for request in requests {
            let msg = GlobalRequest {
                want_reply: true,
                request,
            };
            assert_eq!(GlobalRequest::from_bytes(&msg.to_bytes()).unwrap(), msg);
        }
    }

    #[test]
    fn test_channel_id_message_round_trip() {
        let bytes = channel_id_message(MessageType::ChannelClose, 42);
        assert_eq!(bytes[0], 97);
        assert_eq!(parse_channel_id(&bytes).unwrap(), 42);
    }

    #[test]
    fn test_signal_numbers() {
        assert_eq!(signal_number("TERM"), 15);
        assert_eq!(signal_number("KILL"), 9);
        assert_eq!(signal_number("NOPE"), 0);
    }
}
