//! SSH packet buffer with independent read and write positions.
//!
//! Every SSH message is assembled into and parsed out of an [`SshBuffer`]: a
//! growable byte buffer with a read position and a write position, plus typed
//! accessors for the wire primitives of RFC 4251 Section 5 (byte, boolean,
//! uint32, uint64, string, mpint, name-list).
//!
//! # Header reservation
//!
//! A buffer handed to the encoder must keep [`HEADER_RESERVE`] (5) bytes of
//! headroom in front of its read position; the framer writes the
//! `packet_length` and `padding_length` fields there in place instead of
//! copying the payload. [`SshBuffer::for_message`] sets this up.
//!
//! # Invariant
//!
//! `rpos <= wpos <= capacity` while a buffer is being read or written through
//! the typed accessors. The codec temporarily rewinds `wpos` below `rpos`
//! when framing a packet in place.

use capstan_platform::{TransportError, TransportResult};

use crate::ssh::message::MessageType;

/// Bytes reserved in front of the payload for the packet header
/// (`uint32 packet_length` + `byte padding_length`).
pub const HEADER_RESERVE: usize = 5;

/// Growable byte buffer with distinct read and write positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshBuffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl SshBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding one message: the header reservation, then the
    /// message identifier, ready for the typed putters.
    ///
    /// # Example
    ///
    /// ```rust
    /// use capstan_proto::ssh::buffer::SshBuffer;
    /// use capstan_proto::ssh::message::MessageType;
    ///
    /// let mut buf = SshBuffer::for_message(MessageType::ServiceRequest);
    /// buf.put_string("ssh-userauth");
    /// assert_eq!(buf.payload()[0], 5);
    /// ```
    pub fn for_message(msg: MessageType) -> Self {
        let mut buf = Self {
            data: vec![0u8; HEADER_RESERVE],
            rpos: HEADER_RESERVE,
            wpos: HEADER_RESERVE,
        };
        buf.put_u8(msg as u8);
        buf
    }

    /// Wraps an already-assembled payload for reading (read position at 0).
    pub fn from_payload(data: Vec<u8>) -> Self {
        let wpos = data.len();
        Self { data, rpos: 0, wpos }
    }

    /// Copies a payload behind a fresh header reservation.
    pub fn with_headroom(payload: &[u8]) -> Self {
        let mut buf = Self {
            data: vec![0u8; HEADER_RESERVE],
            rpos: HEADER_RESERVE,
            wpos: HEADER_RESERVE,
        };
        buf.put_raw(payload);
        buf
    }

    /// Number of unread bytes.
    pub fn available(&self) -> usize {
        self.wpos.saturating_sub(self.rpos)
    }

    /// Current read position.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Moves the read position.
    pub fn set_rpos(&mut self, rpos: usize) {
        self.rpos = rpos;
    }

    /// Current write position.
    pub fn wpos(&self) -> usize {
        self.wpos
    }

    /// Moves the write position, growing the underlying storage if needed.
    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.data.len() {
            self.data.resize(wpos, 0);
        }
        self.wpos = wpos;
    }

    /// The readable region (`rpos..wpos`).
    pub fn payload(&self) -> &[u8] {
        &self.data[self.rpos..self.wpos]
    }

    /// The whole backing storage. Used by the codec for in-place work.
    pub fn array(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the whole backing storage.
    pub fn array_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the buffer, returning the readable region as a `Vec`.
    pub fn compact(self) -> Vec<u8> {
        self.data[self.rpos..self.wpos].to_vec()
    }

    fn ensure(&mut self, extra: usize) {
        if self.wpos + extra > self.data.len() {
            self.data.resize(self.wpos + extra, 0);
        }
    }

    // ---- putters ----

    /// Appends a single byte.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.ensure(1);
        self.data[self.wpos] = v;
        self.wpos += 1;
        self
    }

    /// Appends a boolean as one byte (0 or 1).
    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(u8::from(v))
    }

    /// Appends a big-endian `uint32`.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.put_raw(&v.to_be_bytes())
    }

    /// Appends a big-endian `uint64`.
    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.put_raw(&v.to_be_bytes())
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.ensure(v.len());
        self.data[self.wpos..self.wpos + v.len()].copy_from_slice(v);
        self.wpos += v.len();
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.put_raw(v)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    /// Appends an `mpint`: signed big-endian two's-complement, minimal
    /// encoding, zero-padded in front when the high bit would flip the sign.
    pub fn put_mpint(&mut self, v: &[u8]) -> &mut Self {
        let trimmed: &[u8] = {
            let mut s = v;
            while !s.is_empty() && s[0] == 0 {
                s = &s[1..];
            }
            s
        };
        if trimmed.is_empty() {
            return self.put_u32(0);
        }
        if trimmed[0] & 0x80 != 0 {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_raw(trimmed)
    }

    /// Appends a name-list: comma-separated names, length-prefixed.
    pub fn put_name_list(&mut self, names: &[String]) -> &mut Self {
        self.put_string(&names.join(","))
    }

    /// Appends another buffer's readable region.
    pub fn put_buffer(&mut self, other: &SshBuffer) -> &mut Self {
        self.put_raw(other.payload())
    }

    // ---- getters ----

    fn underflow(&self, what: &str) -> TransportError {
        TransportError::protocol(format!(
            "packet underflow reading {} ({} bytes available)",
            what,
            self.available()
        ))
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> TransportResult<u8> {
        if self.available() < 1 {
            return Err(self.underflow("byte"));
        }
        let v = self.data[self.rpos];
        self.rpos += 1;
        Ok(v)
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn get_bool(&mut self) -> TransportResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn get_u32(&mut self) -> TransportResult<u32> {
        if self.available() < 4 {
            return Err(self.underflow("uint32"));
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[self.rpos..self.rpos + 4]);
        self.rpos += 4;
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a big-endian `uint64`.
    pub fn get_u64(&mut self) -> TransportResult<u64> {
        if self.available() < 8 {
            return Err(self.underflow("uint64"));
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[self.rpos..self.rpos + 8]);
        self.rpos += 8;
        Ok(u64::from_be_bytes(b))
    }

    /// Reads `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> TransportResult<Vec<u8>> {
        if self.available() < n {
            return Err(self.underflow("raw bytes"));
        }
        let v = self.data[self.rpos..self.rpos + n].to_vec();
        self.rpos += n;
        Ok(v)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> TransportResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if self.available() < len {
            return Err(self.underflow("byte string"));
        }
        self.get_raw(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> TransportResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| TransportError::protocol("string field is not valid UTF-8"))
    }

    /// Reads an `mpint` as unsigned big-endian magnitude bytes.
    pub fn get_mpint(&mut self) -> TransportResult<Vec<u8>> {
        let mut bytes = self.get_bytes()?;
        // Negative mpints never occur in the SSH messages we handle.
        if bytes.first() == Some(&0) {
            bytes.remove(0);
        }
        Ok(bytes)
    }

    /// Reads a name-list into its component names.
    pub fn get_name_list(&mut self) -> TransportResult<Vec<String>> {
        let s = self.get_string()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(str::to_owned).collect())
    }

    /// Reads the message identifier byte.
    pub fn get_message(&mut self) -> TransportResult<MessageType> {
        let b = self.get_u8()?;
        MessageType::from_u8(b)
            .ok_or_else(|| TransportError::protocol(format!("unknown message id {}", b)))
    }
}
