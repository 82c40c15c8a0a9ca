//! Growable byte cursor for SSH wire types (RFC 4251 Section 5).
//!
//! A [`Buffer`] keeps a read position and a write position over a single backing
//! array whose capacity is always a power of two. Writers append at the write
//! position, growing the array by doubling; readers consume from the read
//! position and fail with a protocol error on underflow.
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::buffer::Buffer;
//!
//! let mut buf = Buffer::new();
//! buf.put_u8(5);
//! buf.put_str("ssh-userauth");
//!
//! assert_eq!(buf.read_u8().unwrap(), 5);
//! assert_eq!(buf.read_utf8().unwrap(), "ssh-userauth");
//! assert_eq!(buf.available(), 0);
//! ```

use skein_platform::{SkeinError, SkeinResult};
use std::fmt;

/// Initial capacity of a fresh buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Largest length prefix accepted for a `string` field.
pub const MAX_STRING_LEN: usize = 256 * 1024;

/// Byte array with independent read and write cursors.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("rpos", &self.rpos)
            .field("wpos", &self.wpos)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty buffer able to hold at least `size` bytes.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            data: vec![0u8; size.max(1).next_power_of_two()],
            rpos: 0,
            wpos: 0,
        }
    }

    /// Creates a buffer whose readable region is a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len());
        buf.put_raw(bytes);
        buf
    }

    /// Total size of the backing array.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes.
    pub fn available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Read cursor.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Write cursor.
    pub fn wpos(&self) -> usize {
        self.wpos
    }

    /// Moves the read cursor. It may not pass the write cursor.
    pub fn set_rpos(&mut self, rpos: usize) -> SkeinResult<()> {
        if rpos > self.wpos {
            return Err(SkeinError::Protocol(format!(
                "Read position {} beyond write position {}",
                rpos, self.wpos
            )));
        }
        self.rpos = rpos;
        Ok(())
    }

    /// Moves the write cursor, growing the array when needed.
    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.wpos {
            self.ensure_capacity(wpos - self.wpos);
        }
        self.wpos = wpos;
        if self.rpos > self.wpos {
            self.rpos = self.wpos;
        }
    }

    /// Unread bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.rpos..self.wpos]
    }

    /// Bytes between `start` and the write cursor, mutable.
    pub fn written_mut(&mut self, start: usize) -> &mut [u8] {
        let start = start.min(self.wpos);
        &mut self.data[start..self.wpos]
    }

    /// Bytes between `start` and the write cursor.
    pub fn written(&self, start: usize) -> &[u8] {
        let start = start.min(self.wpos);
        &self.data[start..self.wpos]
    }

    /// Discards consumed bytes by shifting the unread region to the front.
    pub fn compact(&mut self) {
        if self.rpos == 0 {
            return;
        }
        self.data.copy_within(self.rpos..self.wpos, 0);
        self.wpos -= self.rpos;
        self.rpos = 0;
    }

    /// Resets both cursors.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    /// Guarantees room for `extra` more bytes at the write cursor.
    pub fn ensure_capacity(&mut self, extra: usize) {
        let needed = self.wpos + extra;
        if needed <= self.data.len() {
            return;
        }
        let mut size = self.data.len().max(1);
        while size < needed {
            size *= 2;
        }
        self.data.resize(size, 0);
    }

    fn require(&self, n: usize) -> SkeinResult<()> {
        if self.available() < n {
            return Err(SkeinError::Protocol(format!(
                "Buffer underflow: need {} bytes, {} available",
                n,
                self.available()
            )));
        }
        Ok(())
    }

    // ---- readers ----

    /// Reads one byte.
    pub fn read_u8(&mut self) -> SkeinResult<u8> {
        self.require(1)?;
        let v = self.data[self.rpos];
        self.rpos += 1;
        Ok(v)
    }

    /// Reads a `boolean`; any non-zero byte is true.
    pub fn read_bool(&mut self) -> SkeinResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn read_u32(&mut self) -> SkeinResult<u32> {
        self.require(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[self.rpos..self.rpos + 4]);
        self.rpos += 4;
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a big-endian `uint64`.
    pub fn read_u64(&mut self) -> SkeinResult<u64> {
        self.require(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[self.rpos..self.rpos + 8]);
        self.rpos += 8;
        Ok(u64::from_be_bytes(b))
    }

    /// Reads `n` raw bytes.
    pub fn read_raw(&mut self, n: usize) -> SkeinResult<Vec<u8>> {
        self.require(n)?;
        let v = self.data[self.rpos..self.rpos + n].to_vec();
        self.rpos += n;
        Ok(v)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> SkeinResult<()> {
        self.require(n)?;
        self.rpos += n;
        Ok(())
    }

    /// Reads a length-prefixed `string` as raw bytes.
    pub fn read_string(&mut self) -> SkeinResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(SkeinError::Protocol(format!(
                "String length {} exceeds maximum {}",
                len, MAX_STRING_LEN
            )));
        }
        self.read_raw(len)
    }

    /// Reads a `string` and decodes it as UTF-8.
    pub fn read_utf8(&mut self) -> SkeinResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes)
            .map_err(|_| SkeinError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads an `mpint`, returning its two's complement bytes as sent.
    pub fn read_mpint(&mut self) -> SkeinResult<Vec<u8>> {
        self.read_string()
    }

    /// Reads a comma separated `name-list`.
    pub fn read_name_list(&mut self) -> SkeinResult<Vec<String>> {
        let s = self.read_utf8()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(str::to_string).collect())
    }

    // ---- writers ----

    /// Appends one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.put_raw(&[v]);
    }

    /// Appends a `boolean`.
    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Appends a big-endian `uint32`.
    pub fn put_u32(&mut self, v: u32) {
        self.put_raw(&v.to_be_bytes());
    }

    /// Appends a big-endian `uint64`.
    pub fn put_u64(&mut self, v: u64) {
        self.put_raw(&v.to_be_bytes());
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.data[self.wpos..self.wpos + bytes.len()].copy_from_slice(bytes);
        self.wpos += bytes.len();
    }

    /// Appends a length-prefixed `string`.
    pub fn put_string(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    /// Appends a UTF-8 `string`.
    pub fn put_str(&mut self, s: &str) {
        self.put_string(s.as_bytes());
    }

    /// Appends an unsigned big-endian magnitude as an `mpint`.
    ///
    /// Leading zero bytes are stripped and a zero byte is prepended when the
    /// most significant bit is set, so the value stays positive.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let first = magnitude.iter().position(|&b| b != 0);
        let trimmed = match first {
            Some(i) => &magnitude[i..],
            None => {
                self.put_u32(0);
                return;
            }
        };
        if trimmed[0] & 0x80 != 0 {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_raw(trimmed);
    }

    /// Appends a comma separated `name-list`.
    pub fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }

    /// Appends the unread bytes of another buffer.
    pub fn put_buffer(&mut self, other: &Buffer) {
        self.put_raw(other.as_slice());
    }
}
