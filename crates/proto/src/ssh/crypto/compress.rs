//! Payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` compresses from the first packet; `zlib@openssh.com` is the
//! OpenSSH "delayed" variant that stays dormant until the transport is
//! authenticated. Each direction keeps its own streaming context: the zlib
//! dictionary carries across packets, with a partial flush at each packet
//! boundary.

use capstan_platform::{DisconnectReason, TransportError, TransportResult};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::ssh::buffer::SshBuffer;

/// A (de)compression context pair for one algorithm instance.
pub trait Compression: Send {
    /// Whether this algorithm waits for authentication before activating.
    fn is_delayed(&self) -> bool;

    /// Compresses the buffer's readable region in place.
    fn compress(&mut self, buf: &mut SshBuffer) -> TransportResult<()>;

    /// Decompresses the buffer's readable region in place.
    fn decompress(&mut self, buf: &mut SshBuffer) -> TransportResult<()>;
}

fn compression_error(message: impl Into<String>) -> TransportError {
    TransportError::Protocol {
        reason: DisconnectReason::CompressionError,
        message: message.into(),
    }
}

/// zlib compression, plain or delayed.
pub struct ZlibCompression {
    delayed: bool,
    deflater: Option<Compress>,
    inflater: Option<Decompress>,
}

impl ZlibCompression {
    /// Creates a `zlib` (immediate) context.
    pub fn new() -> Self {
        Self {
            delayed: false,
            deflater: None,
            inflater: None,
        }
    }

    /// Creates a `zlib@openssh.com` (delayed) context.
    pub fn new_delayed() -> Self {
        Self {
            delayed: true,
            deflater: None,
            inflater: None,
        }
    }

    fn deflate(&mut self, input: &[u8]) -> TransportResult<Vec<u8>> {
        let deflater = self
            .deflater
            .get_or_insert_with(|| Compress::new(flate2::Compression::default(), true));

        let mut out = Vec::with_capacity(input.len() + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(8 * 1024);
            }
            let before_in = deflater.total_in();
            let before_out = out.len();
            let status = deflater
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| compression_error(e.to_string()))?;
            consumed += (deflater.total_in() - before_in) as usize;

            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            if out.len() == before_out && matches!(status, Status::BufError) && consumed >= input.len()
            {
                return Ok(out);
            }
        }
    }

    fn inflate(&mut self, input: &[u8]) -> TransportResult<Vec<u8>> {
        let inflater = self.inflater.get_or_insert_with(|| Decompress::new(true));

        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(8 * 1024);
            }
            let before_in = inflater.total_in();
            let before_out = out.len();
            let status = inflater
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| compression_error(e.to_string()))?;
            consumed += (inflater.total_in() - before_in) as usize;

            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            if out.len() == before_out
                && consumed >= input.len()
                && matches!(status, Status::BufError | Status::Ok)
            {
                return Ok(out);
            }
            if out.len() == before_out
                && (inflater.total_in() - before_in) == 0
                && matches!(status, Status::BufError)
            {
                return Err(compression_error("truncated zlib stream"));
            }
        }
    }
}

impl Default for ZlibCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl Compression for ZlibCompression {
    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn compress(&mut self, buf: &mut SshBuffer) -> TransportResult<()> {
        let input = buf.payload().to_vec();
        let out = self.deflate(&input)?;
        let rpos = buf.rpos();
        buf.set_wpos(rpos);
        buf.put_raw(&out);
        Ok(())
    }

    fn decompress(&mut self, buf: &mut SshBuffer) -> TransportResult<()> {
        let input = buf.payload().to_vec();
        let out = self.inflate(&input)?;
        let rpos = buf.rpos();
        buf.set_wpos(rpos);
        buf.put_raw(&out);
        Ok(())
    }
}
