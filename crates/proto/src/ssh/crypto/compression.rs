//! Payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` is active as soon as key exchange installs it. `zlib@openssh.com`
//! is *delayed*: it stays inert until user authentication succeeds. Both keep
//! one deflate (or inflate) stream for the life of a direction and flush with
//! `Z_SYNC_FLUSH` after each packet.

use super::{Mode, NamedFactory};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use skein_platform::{DisconnectReason, SkeinError, SkeinResult};

/// Upper bound on an inflated payload.
const MAX_INFLATED: usize = 256 * 1024;

/// Capability interface for a compression algorithm.
pub trait Compression: Send {
    /// Wire name.
    fn name(&self) -> &'static str;
    /// Whether activation waits for authentication.
    fn is_delayed(&self) -> bool;
    /// Prepares the stream for one direction.
    fn init(&mut self, mode: Mode);
    /// Deflates one payload.
    fn compress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>>;
    /// Inflates one payload.
    fn uncompress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>>;
}

fn compression_error(msg: impl Into<String>) -> SkeinError {
    SkeinError::transport(DisconnectReason::CompressionError, msg)
}

/// zlib stream compression.
pub struct ZlibCompression {
    name: &'static str,
    delayed: bool,
    deflate: Option<Compress>,
    inflate: Option<Decompress>,
}

impl std::fmt::Debug for ZlibCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompression")
            .field("name", &self.name)
            .field("delayed", &self.delayed)
            .finish()
    }
}

impl ZlibCompression {
    /// `zlib`
    pub fn immediate() -> Self {
        Self {
            name: "zlib",
            delayed: false,
            deflate: None,
            inflate: None,
        }
    }

    /// `zlib@openssh.com`
    pub fn delayed() -> Self {
        Self {
            name: "zlib@openssh.com",
            delayed: true,
            deflate: None,
            inflate: None,
        }
    }
}

impl Compression for ZlibCompression {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn init(&mut self, mode: Mode) {
        match mode {
            Mode::Encrypt => self.deflate = Some(Compress::new(flate2::Compression::default(), true)),
            Mode::Decrypt => self.inflate = Some(Decompress::new(true)),
        }
    }

    fn compress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>> {
        let stream = self
            .deflate
            .as_mut()
            .ok_or_else(|| compression_error("deflate stream not initialised"))?;

        let mut out = Vec::with_capacity(data.len() + 64);
        let mut input = data;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(256);
            }
            let before = stream.total_in();
            stream
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(|e| compression_error(format!("deflate failed: {}", e)))?;
            let consumed = (stream.total_in() - before) as usize;
            input = &input[consumed..];
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }

    fn uncompress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>> {
        let stream = self
            .inflate
            .as_mut()
            .ok_or_else(|| compression_error("inflate stream not initialised"))?;

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut input = data;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity());
            }
            let before = stream.total_in();
            let status = stream
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| compression_error(format!("inflate failed: {}", e)))?;
            let consumed = (stream.total_in() - before) as usize;
            input = &input[consumed..];

            if out.len() > MAX_INFLATED {
                return Err(compression_error(format!(
                    "inflated payload exceeds {} bytes",
                    MAX_INFLATED
                )));
            }
            if status == Status::StreamEnd {
                break;
            }
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && out.len() < out.capacity() {
                return Err(compression_error("inflate made no progress"));
            }
        }
        Ok(out)
    }
}

/// Compression algorithms offered by default. `none` stays first so that a
/// peer that does not compress is never forced to.
pub fn default_factories() -> Vec<NamedFactory<dyn Compression>> {
    vec![
        NamedFactory::new("none", || Box::new(NoCompression)),
        NamedFactory::new("zlib@openssh.com", || Box::new(ZlibCompression::delayed())),
        NamedFactory::new("zlib", || Box::new(ZlibCompression::immediate())),
    ]
}

/// Identity compression; never installed into the codec.
#[derive(Debug, Default)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_delayed(&self) -> bool {
        false
    }

    fn init(&mut self, _mode: Mode) {}

    fn compress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn uncompress(&mut self, data: &[u8]) -> SkeinResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}
