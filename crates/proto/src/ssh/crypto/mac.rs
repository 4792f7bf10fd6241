//! Message authentication codes for the SSH binary packet protocol.
//!
//! The MAC is computed over `uint32 sequence_number || cleartext packet` and
//! travels outside the encryption (RFC 4253 Section 6.4). The `-96` variants
//! truncate the tag to 96 bits on the wire but still take the full-length
//! key.

use capstan_platform::{TransportError, TransportResult};
use hmac::{Hmac, Mac as _};
use md5::Md5;
use sha1::Sha1;

/// A keyed MAC instance for one direction.
pub trait Mac: Send {
    /// Tag length on the wire in bytes.
    fn size(&self) -> usize;

    /// Feeds the packet sequence number.
    fn update_u32(&mut self, v: u32);

    /// Feeds packet bytes.
    fn update(&mut self, data: &[u8]);

    /// Writes the tag into `out` (exactly [`Mac::size`] bytes) and resets
    /// for the next packet.
    fn finalize_into(&mut self, out: &mut [u8]);
}

macro_rules! hmac_impl {
    ($struct_name:ident, $digest:ty, $full_len:expr) => {
        struct $struct_name {
            mac: Hmac<$digest>,
            out_len: usize,
        }

        impl $struct_name {
            fn create(key: &[u8], out_len: usize) -> TransportResult<Box<dyn Mac>> {
                let mac = Hmac::<$digest>::new_from_slice(key).map_err(|_| {
                    TransportError::KexFailed("MAC key has wrong length".to_string())
                })?;
                Ok(Box::new(Self { mac, out_len }))
            }
        }

        impl Mac for $struct_name {
            fn size(&self) -> usize {
                self.out_len
            }

            fn update_u32(&mut self, v: u32) {
                self.mac.update(&v.to_be_bytes());
            }

            fn update(&mut self, data: &[u8]) {
                self.mac.update(data);
            }

            fn finalize_into(&mut self, out: &mut [u8]) {
                let tag = self.mac.finalize_reset().into_bytes();
                out.copy_from_slice(&tag[..self.out_len]);
            }
        }
    };
}

hmac_impl!(HmacSha1, Sha1, 20);
hmac_impl!(HmacMd5, Md5, 16);

/// `hmac-sha1`: 20-byte key, 20-byte tag.
pub(crate) fn hmac_sha1(key: &[u8]) -> TransportResult<Box<dyn Mac>> {
    HmacSha1::create(key, 20)
}

/// `hmac-sha1-96`: 20-byte key, tag truncated to 12 bytes.
pub(crate) fn hmac_sha1_96(key: &[u8]) -> TransportResult<Box<dyn Mac>> {
    HmacSha1::create(key, 12)
}

/// `hmac-md5`: 16-byte key, 16-byte tag.
pub(crate) fn hmac_md5(key: &[u8]) -> TransportResult<Box<dyn Mac>> {
    HmacMd5::create(key, 16)
}

/// `hmac-md5-96`: 16-byte key, tag truncated to 12 bytes.
pub(crate) fn hmac_md5_96(key: &[u8]) -> TransportResult<Box<dyn Mac>> {
    HmacMd5::create(key, 12)
}
