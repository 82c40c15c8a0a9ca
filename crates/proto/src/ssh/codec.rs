//! SSH binary packet codec (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! The [`Encoder`] and [`Decoder`] each hold one direction's [`CodecState`]
//! (cipher, MAC, compression) and sequence number. Key exchange swaps a new
//! state in with [`Encoder::install`] / [`Decoder::install`]; sequence numbers
//! carry on across the swap.
//!
//! The decoder is incremental. Feed it whatever bytes arrive with
//! [`Decoder::received`], drain complete packets with [`Decoder::next_packet`],
//! and ask [`Decoder::bytes_needed`] how much more to read.
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::codec::{Decoder, Encoder};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let authenticated = Arc::new(AtomicBool::new(false));
//! let mut encoder = Encoder::new(authenticated.clone());
//! let mut decoder = Decoder::new(authenticated);
//!
//! let (frame, seq) = encoder.encode(&[2, 0, 0, 0, 0]).unwrap();
//! assert_eq!(seq, 0);
//!
//! decoder.received(&frame);
//! let packet = decoder.next_packet().unwrap().unwrap();
//! assert_eq!(packet.payload.as_slice(), &[2, 0, 0, 0, 0]);
//! ```

use crate::ssh::buffer::Buffer;
use crate::ssh::crypto::cipher::NoneCipher;
use crate::ssh::crypto::mac::tags_equal;
use crate::ssh::crypto::{Cipher, Compression, Mac};
use rand::RngCore;
use skein_platform::{DisconnectReason, SkeinError, SkeinResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Smallest legal `packet_length`.
pub const MIN_PACKET_LENGTH: usize = 5;

/// Largest legal `packet_length` (256 KiB).
pub const MAX_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: usize = 4;

/// Algorithms active for one direction.
pub struct CodecState {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    compression: Option<Box<dyn Compression>>,
}

impl std::fmt::Debug for CodecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecState")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.as_ref().map(|m| m.name()))
            .field("compression", &self.compression.as_ref().map(|c| c.name()))
            .finish()
    }
}

impl Default for CodecState {
    fn default() -> Self {
        Self::plaintext()
    }
}

impl CodecState {
    /// Initialised algorithms for one direction.
    pub fn new(
        cipher: Box<dyn Cipher>,
        mac: Option<Box<dyn Mac>>,
        compression: Option<Box<dyn Compression>>,
    ) -> Self {
        Self {
            cipher,
            mac,
            compression,
        }
    }

    /// The pre-kex state: no encryption, no MAC, no compression.
    pub fn plaintext() -> Self {
        Self::new(Box::new(NoneCipher), None, None)
    }

    /// Framing alignment for this state.
    pub fn block_size(&self) -> usize {
        self.cipher.block_size().max(8)
    }

    fn mac_size(&self) -> usize {
        self.mac.as_ref().map_or(0, |m| m.size())
    }

    /// Compression to apply now, honouring the delayed flag.
    fn active_compression(
        &mut self,
        authenticated: &AtomicBool,
    ) -> Option<&mut Box<dyn Compression>> {
        match self.compression.as_mut() {
            Some(c) if compression_active(c.as_ref(), authenticated.load(Ordering::Acquire)) => {
                Some(c)
            }
            _ => None,
        }
    }
}

/// Activation rule shared by both directions: a delayed algorithm waits for
/// user authentication, any other is active as soon as it is installed.
pub fn compression_active(compression: &dyn Compression, authenticated: bool) -> bool {
    !compression.is_delayed() || authenticated
}

fn mac_error(msg: impl Into<String>) -> SkeinError {
    SkeinError::transport(DisconnectReason::MacError, msg)
}

/// Outbound half of the codec.
pub struct Encoder {
    state: CodecState,
    seq: u32,
    authenticated: Arc<AtomicBool>,
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("state", &self.state)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Encoder {
    /// Creates a plaintext encoder. `authenticated` gates delayed compression.
    pub fn new(authenticated: Arc<AtomicBool>) -> Self {
        Self {
            state: CodecState::plaintext(),
            seq: 0,
            authenticated,
        }
    }

    /// Swaps in new algorithms; the sequence number is preserved.
    pub fn install(&mut self, state: CodecState) {
        trace!("Encoder switching to {:?}", state);
        self.state = state;
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Frames, authenticates and encrypts one payload.
    ///
    /// Returns the wire bytes and the sequence number assigned to the packet.
    pub fn encode(&mut self, payload: &[u8]) -> SkeinResult<(Vec<u8>, u32)> {
        let compressed;
        let payload = match self.state.active_compression(&self.authenticated) {
            Some(c) => {
                compressed = c.compress(payload)?;
                &compressed[..]
            }
            None => payload,
        };

        let block_size = self.state.block_size();
        let mut padding = block_size - (payload.len() + 5) % block_size;
        if padding < MIN_PADDING_LEN {
            padding += block_size;
        }
        let packet_length = payload.len() + 1 + padding;
        if packet_length > MAX_PACKET_LENGTH {
            return Err(SkeinError::Protocol(format!(
                "Packet too large: {} bytes (max {})",
                packet_length, MAX_PACKET_LENGTH
            )));
        }

        let mac_size = self.state.mac_size();
        let mut frame = Buffer::with_capacity(4 + packet_length + mac_size);
        frame.put_u32(packet_length as u32);
        frame.put_u8(padding as u8);
        frame.put_raw(payload);
        let pad_start = frame.wpos();
        frame.set_wpos(pad_start + padding);
        rand::thread_rng().fill_bytes(frame.written_mut(pad_start));

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let tag = match self.state.mac.as_mut() {
            Some(mac) => {
                mac.update_u32(seq);
                mac.update(frame.as_slice());
                Some(mac.do_final()?)
            }
            None => None,
        };

        self.state.cipher.update(frame.written_mut(0))?;
        if let Some(tag) = tag {
            frame.put_raw(&tag);
        }

        Ok((frame.as_slice().to_vec(), seq))
    }
}

/// One decoded packet.
#[derive(Debug)]
pub struct Inbound {
    /// Sequence number the packet arrived with.
    pub seq: u32,
    /// Payload, starting with the message id.
    pub payload: Buffer,
}

/// Inbound half of the codec.
pub struct Decoder {
    state: CodecState,
    seq: u32,
    authenticated: Arc<AtomicBool>,
    input: Buffer,
    /// `packet_length` of the packet whose first block is already decrypted.
    pending: Option<usize>,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("state", &self.state)
            .field("seq", &self.seq)
            .field("buffered", &self.input.available())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Decoder {
    /// Creates a plaintext decoder. `authenticated` gates delayed compression.
    pub fn new(authenticated: Arc<AtomicBool>) -> Self {
        Self {
            state: CodecState::plaintext(),
            seq: 0,
            authenticated,
            input: Buffer::with_capacity(MAX_PACKET_LENGTH / 8),
            pending: None,
        }
    }

    /// Swaps in new algorithms; the sequence number is preserved.
    ///
    /// Must be called between packets (never while one is half decoded).
    pub fn install(&mut self, state: CodecState) {
        trace!("Decoder switching to {:?}", state);
        self.state = state;
    }

    /// Sequence number the next packet is expected to carry.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Appends raw bytes from the socket.
    pub fn received(&mut self, bytes: &[u8]) {
        if self.input.rpos() > 0 && self.pending.is_none() {
            self.input.compact();
        }
        self.input.put_raw(bytes);
    }

    /// Bytes still required before another packet can be produced.
    pub fn bytes_needed(&self) -> usize {
        let target = match self.pending {
            None => self.state.block_size(),
            Some(len) => 4 + len + self.state.mac_size(),
        };
        target.saturating_sub(self.input.available()).max(1)
    }

    /// Decodes the next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> SkeinResult<Option<Inbound>> {
        let block_size = self.state.block_size();

        let packet_length = match self.pending {
            Some(len) => len,
            None => {
                if self.input.available() < block_size {
                    return Ok(None);
                }
                let start = self.input.rpos();
                self.state
                    .cipher
                    .update(&mut self.input.written_mut(start)[..block_size])?;
                let head = self.input.as_slice();
                let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
                if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&len) {
                    return Err(SkeinError::Protocol(format!(
                        "Invalid packet length: {}",
                        len
                    )));
                }
                if (len + 4) % block_size != 0 {
                    return Err(SkeinError::Protocol(format!(
                        "Packet length {} not aligned to block size {}",
                        len, block_size
                    )));
                }
                self.pending = Some(len);
                len
            }
        };

        let mac_size = self.state.mac_size();
        let frame_len = 4 + packet_length;
        if self.input.available() < frame_len + mac_size {
            return Ok(None);
        }

        let start = self.input.rpos();
        self.state
            .cipher
            .update(&mut self.input.written_mut(start)[block_size..frame_len])?;

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.pending = None;

        let data = self.input.as_slice();
        let frame = &data[..frame_len];
        if let Some(mac) = self.state.mac.as_mut() {
            mac.update_u32(seq);
            mac.update(frame);
            let computed = mac.do_final()?;
            if !tags_equal(&computed, &data[frame_len..frame_len + mac_size]) {
                return Err(mac_error(format!("MAC mismatch on packet {}", seq)));
            }
        }

        let padding = frame[4] as usize;
        if padding < MIN_PADDING_LEN || padding + 1 >= packet_length {
            return Err(SkeinError::Protocol(format!(
                "Invalid padding length {} for packet length {}",
                padding, packet_length
            )));
        }
        let payload = &frame[5..frame_len - padding];

        let payload = match self.state.active_compression(&self.authenticated) {
            Some(c) => Buffer::from_slice(&c.uncompress(payload)?),
            None => Buffer::from_slice(payload),
        };

        self.input.skip(frame_len + mac_size)?;
        Ok(Some(Inbound { seq, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::mac::{HmacAlgorithm, HmacMac};
    use crate::ssh::crypto::{AesCbc, AesCtr, Mode, ZlibCompression};

    fn flag(value: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(value))
    }

    fn ctr_state(mode: Mode, with_mac: bool) -> CodecState {
        let mut cipher = AesCtr::aes128();
        cipher.init(mode, &[3u8; 16], &[4u8; 16]).unwrap();
        let mac = with_mac.then(|| {
            let mut mac = HmacMac::new(HmacAlgorithm::Sha256);
            mac.init(&[5u8; 32]).unwrap();
            Box::new(mac) as Box<dyn Mac>
        });
        CodecState::new(Box::new(cipher), mac, None)
    }

    fn pair() -> (Encoder, Decoder) {
        let auth = flag(false);
        (Encoder::new(auth.clone()), Decoder::new(auth))
    }

    #[test]
    fn test_plaintext_padding() {
        let (mut encoder, _) = pair();
        for len in 1..40 {
            let payload = vec![0x42; len];
            let (frame, _) = encoder.encode(&payload).unwrap();
            assert_eq!(frame.len() % 8, 0);
            let padding = frame[4] as usize;
            assert!(padding >= MIN_PADDING_LEN);
            assert_eq!(len + 1 + padding + 4, frame.len());
        }
    }

    #[test]
    fn test_sequence_numbers_match() {
        let (mut encoder, mut decoder) = pair();
        for i in 0..5u32 {
            let (frame, seq) = encoder.encode(&[94, i as u8]).unwrap();
            assert_eq!(seq, i);
            decoder.received(&frame);
            let packet = decoder.next_packet().unwrap().unwrap();
            assert_eq!(packet.seq, seq);
            assert_eq!(packet.payload.as_slice(), &[94, i as u8]);
        }
        assert_eq!(encoder.sequence(), decoder.sequence());
    }

    #[test]
    fn test_encrypted_with_mac() {
        let (mut encoder, mut decoder) = pair();
        encoder.install(ctr_state(Mode::Encrypt, true));
        decoder.install(ctr_state(Mode::Decrypt, true));

        let payload: Vec<u8> = (0..200u8).collect();
        let (frame, _) = encoder.encode(&payload).unwrap();
        assert_eq!((frame.len() - 32) % 16, 0);
        assert_ne!(&frame[5..205], &payload[..]);

        decoder.received(&frame);
        let packet = decoder.next_packet().unwrap().unwrap();
        assert_eq!(packet.payload.as_slice(), &payload[..]);
    }

    #[test]
    fn test_cbc_round_trip() {
        let make = |mode| {
            let mut c = AesCbc::aes256();
            c.init(mode, &[8u8; 32], &[9u8; 16]).unwrap();
            CodecState::new(Box::new(c), None, None)
        };
        let (mut encoder, mut decoder) = pair();
        encoder.install(make(Mode::Encrypt));
        decoder.install(make(Mode::Decrypt));

        for msg in [&b"one"[..], &[7u8; 100][..], &b"three"[..]] {
            let (frame, _) = encoder.encode(msg).unwrap();
            decoder.received(&frame);
            assert_eq!(decoder.next_packet().unwrap().unwrap().payload.as_slice(), msg);
        }
    }

    #[test]
    fn test_incremental_feed() {
        let (mut encoder, mut decoder) = pair();
        encoder.install(ctr_state(Mode::Encrypt, true));
        decoder.install(ctr_state(Mode::Decrypt, true));

        let (frame, _) = encoder.encode(&[50; 77]).unwrap();
        assert_eq!(decoder.bytes_needed(), 16);

        let mut fed = 0;
        let mut result = None;
        while result.is_none() {
            let n = decoder.bytes_needed().min(frame.len() - fed);
            decoder.received(&frame[fed..fed + n]);
            fed += n;
            result = decoder.next_packet().unwrap();
        }
        assert_eq!(fed, frame.len());
        assert_eq!(result.unwrap().payload.as_slice(), &[50; 77][..]);
    }

    #[test]
    fn test_mac_mismatch_is_fatal() {
        let (mut encoder, mut decoder) = pair();
        encoder.install(ctr_state(Mode::Encrypt, true));
        decoder.install(ctr_state(Mode::Decrypt, true));

        let (mut frame, _) = encoder.encode(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        decoder.received(&frame);

        let err = decoder.next_packet().unwrap_err();
        assert_eq!(err.disconnect_reason(), DisconnectReason::MacError);
    }

    #[test]
    fn test_length_bounds() {
        for bad in [0u32, 4, (MAX_PACKET_LENGTH + 1) as u32, u32::MAX] {
            let mut decoder = Decoder::new(flag(false));
            let mut bytes = bad.to_be_bytes().to_vec();
            bytes.extend_from_slice(&[4, 0, 0, 0]);
            decoder.received(&bytes);
            match decoder.next_packet() {
                Err(SkeinError::Protocol(msg)) => assert!(msg.contains("Invalid packet length")),
                other => panic!("length {} accepted: {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_rejects_before_payload_arrives() {
        let mut decoder = Decoder::new(flag(false));
        decoder.received(&[0x00, 0x10, 0x00, 0x00, 0x04, 0, 0, 0]);
        // Only the first block is present; the bad length is caught anyway.
        assert!(decoder.next_packet().is_err());
    }

    #[test]
    fn test_delayed_compression_waits_for_auth() {
        let auth = flag(false);
        let mut encoder = Encoder::new(auth.clone());
        let mut decoder = Decoder::new(auth.clone());

        let mut deflate = ZlibCompression::delayed();
        deflate.init(Mode::Encrypt);
        let mut inflate = ZlibCompression::delayed();
        inflate.init(Mode::Decrypt);
        encoder.install(CodecState::new(Box::new(NoneCipher), None, Some(Box::new(deflate))));
        decoder.install(CodecState::new(Box::new(NoneCipher), None, Some(Box::new(inflate))));

        let payload = vec![b'z'; 1000];
        let (before, _) = encoder.encode(&payload).unwrap();
        assert!(before.len() > 1000);
        decoder.received(&before);
        assert_eq!(decoder.next_packet().unwrap().unwrap().payload.as_slice(), &payload[..]);

        auth.store(true, Ordering::Release);
        let (after, _) = encoder.encode(&payload).unwrap();
        assert!(after.len() < 100);
        decoder.received(&after);
        assert_eq!(decoder.next_packet().unwrap().unwrap().payload.as_slice(), &payload[..]);
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut encoder, mut decoder) = pair();
        encoder.seq = u32::MAX;
        decoder.seq = u32::MAX;
        let (frame, seq) = encoder.encode(&[2]).unwrap();
        assert_eq!(seq, u32::MAX);
        assert_eq!(encoder.sequence(), 0);
        decoder.received(&frame);
        assert_eq!(decoder.next_packet().unwrap().unwrap().seq, u32::MAX);
        assert_eq!(decoder.sequence(), 0);
    }

    #[test]
    fn test_bad_padding() {
        let mut decoder = Decoder::new(flag(false));
        // packet_length 12, padding 11: no room for a payload
        decoder.received(&[0, 0, 0, 12, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(decoder.next_packet(), Err(SkeinError::Protocol(_))));
    }
}
