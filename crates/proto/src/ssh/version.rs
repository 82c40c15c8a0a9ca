//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string before anything else:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other lines first (a pre-identification banner). Those
//! are logged and skipped.
//!
//! # Limits
//!
//! - Maximum line length: 255 bytes including CR LF
//! - At most 1024 banner lines before the identification line
//! - The identification must start with "SSH-2.0-" or "SSH-1.99-"
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::version::Version;
//!
//! let version = Version::new("skein_0.1.0");
//! assert_eq!(version.to_string(), "SSH-2.0-skein_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert_eq!(parsed.comments(), Some("Ubuntu-3"));
//! ```

use skein_platform::{DisconnectReason, SkeinError, SkeinResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Maximum length of one identification or banner line.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of banner lines tolerated before the identification.
pub const MAX_BANNER_LINES: usize = 1024;

/// An SSH identification string.
///
/// The exact text (without CR LF) is kept, since it is hashed into the
/// key exchange transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    line: String,
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an `SSH-2.0-<software>` identification.
    pub fn new(software: &str) -> Self {
        Self {
            line: format!("SSH-2.0-{}", software),
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: None,
        }
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// - [`SkeinError::Protocol`] if the line is too long or contains a NUL
    /// - [`SkeinError::Transport`] with `PROTOCOL_VERSION_NOT_SUPPORTED` if
    ///   the protocol version is not 2.0 or 1.99
    pub fn parse(line: &str) -> SkeinResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkeinError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(SkeinError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        let (proto_version, rest) = if let Some(rest) = line.strip_prefix("SSH-2.0-") {
            ("2.0", rest)
        } else if let Some(rest) = line.strip_prefix("SSH-1.99-") {
            ("1.99", rest)
        } else {
            return Err(SkeinError::transport(
                DisconnectReason::ProtocolVersionNotSupported,
                format!("Server sent unsupported identification '{}'", line),
            ));
        };

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            line: line.to_string(),
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Protocol version ("2.0" or "1.99").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version (e.g. "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Comments after the software version, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The exact identification text without CR LF.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Sends our identification line.
pub async fn send_identification<W>(writer: &mut W, version: &Version) -> SkeinResult<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("Sending identification: {}", version);
    writer.write_all(&version.to_wire_format()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads lines until the server identification, skipping any banner.
///
/// Bytes are consumed one at a time so nothing past the identification line
/// is read from `reader`.
pub async fn read_identification<R>(reader: &mut R) -> SkeinResult<Version>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..=MAX_BANNER_LINES {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            info!("Server identification: {}", version);
            return Ok(version);
        }
        debug!("Server banner: {}", line);
    }
    Err(SkeinError::Protocol(format!(
        "No identification after {} banner lines",
        MAX_BANNER_LINES
    )))
}

async fn read_line<R>(reader: &mut R) -> SkeinResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkeinError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| SkeinError::Protocol("Identification line is not UTF-8".to_string()))
}
