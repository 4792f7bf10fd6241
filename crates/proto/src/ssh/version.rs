//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with an identification exchange where both sides
//! send a line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may precede its identification with other text lines (up to
//! 16 KiB in total), which clients must skip.
//!
//! # Example
//!
//! ```rust
//! use capstan_proto::ssh::version::Version;
//!
//! let version = Version::new("Capstan_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Capstan_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use capstan_platform::{DisconnectReason, TransportError, TransportResult};

/// Maximum length of one identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum bytes of preamble to scan before the identification line.
pub const MAX_PREAMBLE: usize = 16 * 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH-2.0 identification.
    ///
    /// # Example
    ///
    /// ```rust
    /// use capstan_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Capstan_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Capstan_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Parses an identification line.
    ///
    /// # Errors
    ///
    /// Returns a protocol error (reason PROTOCOL_VERSION_NOT_SUPPORTED for a
    /// non-2.0 protocol version) if:
    /// - the line is longer than 255 characters
    /// - the line does not start with `SSH-2.0-`
    /// - the line contains a null byte
    pub fn parse(line: &str) -> TransportResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TransportError::protocol(format!(
                "identification line too long: {} bytes",
                line.len()
            )));
        }
        if line.contains('\0') {
            return Err(TransportError::protocol(
                "identification line contains null byte",
            ));
        }
        if !line.starts_with("SSH-") {
            return Err(TransportError::protocol(format!(
                "identification line does not start with SSH-: `{}`",
                line
            )));
        }
        let rest = match line.strip_prefix("SSH-2.0-") {
            Some(rest) => rest,
            None => {
                return Err(TransportError::Protocol {
                    reason: DisconnectReason::ProtocolVersionNotSupported,
                    message: format!("unsupported protocol version in `{}`", line),
                })
            }
        };

        let (software_version, comments) = match rest.find(' ') {
            Some(pos) => (rest[..pos].to_string(), Some(rest[pos + 1..].to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            software_version,
            comments,
        })
    }

    /// Returns the software version (e.g. "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-2.0-{}", self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}
