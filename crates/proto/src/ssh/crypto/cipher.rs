//! Block ciphers for the SSH binary packet protocol.
//!
//! SSH CBC ciphers run as a single streaming context per direction: the IV
//! chains across packets, so one [`Cipher`] instance lives for the whole
//! lifetime of an algorithm set and processes each packet in place.

use capstan_platform::{TransportError, TransportResult};
use cipher::generic_array::GenericArray;
use cipher::{BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyIvInit, KeyInit};

/// Whether a cipher instance encrypts or decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound: encrypt in place.
    Encrypt,
    /// Inbound: decrypt in place.
    Decrypt,
}

/// A streaming block cipher working in place on whole blocks.
pub trait Cipher: Send {
    /// Cipher block size in bytes (8 for the identity cipher).
    fn block_size(&self) -> usize;

    /// Transforms `data` in place. `data.len()` must be a multiple of the
    /// block size.
    fn update(&mut self, data: &mut [u8]) -> TransportResult<()>;
}

/// Identity cipher used before NEWKEYS. Reports the protocol-minimum block
/// size of 8 so framing stays 8-byte aligned.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn update(&mut self, _data: &mut [u8]) -> TransportResult<()> {
        Ok(())
    }
}

fn check_len(len: usize, block: usize) -> TransportResult<()> {
    if len % block != 0 {
        return Err(TransportError::protocol(format!(
            "cipher input of {} bytes is not a multiple of the {}-byte block",
            len, block
        )));
    }
    Ok(())
}

struct CbcEncrypt<C>(cbc::Encryptor<C>)
where
    C: BlockEncrypt + BlockCipher;

impl<C> Cipher for CbcEncrypt<C>
where
    C: BlockEncrypt + BlockCipher + Send,
{
    fn block_size(&self) -> usize {
        C::block_size()
    }

    fn update(&mut self, data: &mut [u8]) -> TransportResult<()> {
        check_len(data.len(), C::block_size())?;
        for block in data.chunks_exact_mut(C::block_size()) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

struct CbcDecrypt<C>(cbc::Decryptor<C>)
where
    C: BlockDecrypt + BlockCipher;

impl<C> Cipher for CbcDecrypt<C>
where
    C: BlockDecrypt + BlockCipher + Send,
{
    fn block_size(&self) -> usize {
        C::block_size()
    }

    fn update(&mut self, data: &mut [u8]) -> TransportResult<()> {
        check_len(data.len(), C::block_size())?;
        for block in data.chunks_exact_mut(C::block_size()) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

/// Builds a CBC cipher instance for `C` in the given direction.
pub(crate) fn cbc_cipher<C>(
    direction: CipherDirection,
    key: &[u8],
    iv: &[u8],
) -> TransportResult<Box<dyn Cipher>>
where
    C: BlockEncrypt + BlockDecrypt + BlockCipher + KeyInit + Send + 'static,
{
    let bad_key = |_| TransportError::KexFailed("cipher key or IV has wrong length".to_string());
    match direction {
        CipherDirection::Encrypt => {
            let enc = cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?;
            Ok(Box::new(CbcEncrypt(enc)))
        }
        CipherDirection::Decrypt => {
            let dec = cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?;
            Ok(Box::new(CbcDecrypt(dec)))
        }
    }
}
