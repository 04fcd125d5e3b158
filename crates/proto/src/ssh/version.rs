//! SSH identification exchange (RFC 4253 Section 4.2).
//!
//! The connection begins with each side sending an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may precede its identification with free-text greeting lines;
//! peers capture those lines and discard them from protocol semantics. The
//! received identification must declare protocol version "2.0" or "1.99";
//! anything else is a fatal "Protocol version not supported" error.
//!
//! The software-version substring is matched against a fixed table of
//! known-buggy peer implementations and the resulting [`PeerQuirks`] are
//! recorded for the session.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("Skiff_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use skiff_platform::{SkiffError, SkiffResult};

/// Maximum length of an SSH identification line including CR LF
/// (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Behavioral quirks of known-buggy peer implementations.
///
/// Recorded once per session from the peer's software-version substring and
/// consulted by the kex engine and the channel layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerQuirks {
    /// Peer mishandles diffie-hellman group exchange; never negotiate it.
    pub no_group_exchange: bool,
    /// Peer expects the pre-standard numeric encoding of the exit-signal
    /// channel request instead of the signal name.
    pub legacy_exit_signal: bool,
}

impl PeerQuirks {
    /// Looks up quirks for a peer's software-version substring.
    ///
    /// The table is fixed; unknown software gets no quirks.
    pub fn detect(software: &str) -> Self {
        let mut quirks = Self::default();

        // Cisco IOS 1.x advertises group-exchange but mangles the group
        // negotiation messages.
        if software.starts_with("Cisco-1.") {
            quirks.no_group_exchange = true;
        }

        // Pre-4.4 OpenSSH sent exit-signal with the draft's numeric signal
        // encoding.
        if let Some(rest) = software.strip_prefix("OpenSSH_") {
            let old = rest.starts_with("2.")
                || rest.starts_with("3.")
                || ["4.0", "4.1", "4.2", "4.3"]
                    .iter()
                    .any(|v| rest.starts_with(v));
            if old {
                quirks.legacy_exit_signal = true;
            }
        }

        quirks
    }
}

/// SSH protocol identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version ("2.0" or "1.99")
    proto_version: String,
    /// Software version (e.g., "Skiff_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH identification string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Skiff_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Skiff identification string.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Line is too long (> 255 bytes)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains NUL bytes
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_8.9");
    /// ```
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Identification string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Identification string contains NUL byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "Invalid identification string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // Parse: SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "Invalid identification string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Protocol version not supported: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = if let Some(space_pos) = rest.find(' ') {
            let software = rest[..space_pos].to_string();
            let comments = rest[space_pos + 1..].trim().to_string();
            (software, Some(comments))
        } else {
            (rest.to_string(), None)
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Skiff_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the quirks of the peer this identification belongs to.
    pub fn quirks(&self) -> PeerQuirks {
        PeerQuirks::detect(&self.software_version)
    }

    /// Converts to wire format (with CR LF).
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Skiff_0.1.0", None);
    /// assert_eq!(version.to_wire_format(), b"SSH-2.0-Skiff_0.1.0\r\n");
    /// ```
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Splits a received line off an accumulating buffer of identification
/// data. Returns the line (without terminator) and bytes consumed, or
/// `None` if no full line is buffered yet.
pub fn take_identification_line(buf: &[u8]) -> Option<(String, usize)> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let mut line = &buf[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    Some((String::from_utf8_lossy(line).into_owned(), nl + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Skiff_0.1.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display_with_comments() {
        let version = Version::new("Skiff_0.1.0", Some("test comment"));
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0 test comment");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
    }

    #[test]
    fn test_version_parse_legacy_1_99() {
        let version = Version::parse("SSH-1.99-OldServer_1.0").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_with_comments_and_crlf() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        let result = Version::parse("SSH-1.5-AncientClient");
        match result {
            Err(SkiffError::Protocol(msg)) => {
                assert!(msg.contains("Protocol version not supported"));
            }
            _ => panic!("Expected Protocol error"),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_version_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Skiff_0.1.0\r\n");
    }

    #[test]
    fn test_quirks_cisco_gex() {
        let quirks = PeerQuirks::detect("Cisco-1.25");
        assert!(quirks.no_group_exchange);
        assert!(!quirks.legacy_exit_signal);
    }

    #[test]
    fn test_quirks_old_openssh_exit_signal() {
        assert!(PeerQuirks::detect("OpenSSH_3.9p1").legacy_exit_signal);
        assert!(PeerQuirks::detect("OpenSSH_4.3").legacy_exit_signal);
        assert!(!PeerQuirks::detect("OpenSSH_4.4").legacy_exit_signal);
        assert!(!PeerQuirks::detect("OpenSSH_8.9").legacy_exit_signal);
    }

    #[test]
    fn test_quirks_unknown_software() {
        assert_eq!(PeerQuirks::detect("Skiff_0.1.0"), PeerQuirks::default());
    }

    #[test]
    fn test_take_line() {
        let buf = b"Welcome!\r\nSSH-2.0-Server\r\n";
        let (line, used) = take_identification_line(buf).unwrap();
        assert_eq!(line, "Welcome!");
        let (line2, _) = take_identification_line(&buf[used..]).unwrap();
        assert_eq!(line2, "SSH-2.0-Server");
    }

    #[test]
    fn test_take_line_incomplete() {
        assert!(take_identification_line(b"SSH-2.0-partial").is_none());
    }
}
