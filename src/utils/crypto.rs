//! Channel cipher.
//!
//! AES-256 with an authenticated IV. The 16-byte IV is
//! `HMAC-SHA1(secret, R || plaintext)[..13] || R` where `R` is 3 random bytes and
//! `secret` is the first 16 bytes of the session key. On the wire:
//!
//! ```text
//! [AES-ECB(IV); 16] [AES-CBC-PKCS7(plaintext, IV)]
//! ```
//!
//! Decryption recomputes the HMAC over the recovered plaintext and compares it
//! in constant time against the IV, so a tampered message never yields
//! plaintext.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha1 = Hmac<Sha1>;

pub const SESSION_KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
const IV_RANDOM_LEN: usize = 3;
const IV_HMAC_LEN: usize = BLOCK_LEN - IV_RANDOM_LEN;
const HMAC_SECRET_LEN: usize = 16;

/// Generate a fresh random session key.
pub fn generate_session_key() -> Zeroizing<[u8; SESSION_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Symmetric cipher state for one encrypted connection.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct CipherContext {
    key: [u8; SESSION_KEY_LEN],
    hmac_secret: [u8; HMAC_SECRET_LEN],
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherContext { .. }")
    }
}

impl CipherContext {
    pub fn new(key: &[u8; SESSION_KEY_LEN]) -> Self {
        let mut hmac_secret = [0u8; HMAC_SECRET_LEN];
        hmac_secret.copy_from_slice(&key[..HMAC_SECRET_LEN]);
        Self {
            key: *key,
            hmac_secret,
        }
    }

    /// Upper bound on the ciphertext length for `len` bytes of plaintext.
    pub fn max_encrypted_len(len: usize) -> usize {
        BLOCK_LEN + ((len + BLOCK_LEN) / BLOCK_LEN) * BLOCK_LEN
    }

    fn iv_hmac(&self, random: &[u8], plaintext: &[u8]) -> Result<[u8; IV_HMAC_LEN]> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.hmac_secret)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        mac.update(random);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; IV_HMAC_LEN];
        out.copy_from_slice(&digest[..IV_HMAC_LEN]);
        Ok(out)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; BLOCK_LEN];
        OsRng.fill_bytes(&mut iv[IV_HMAC_LEN..]);
        let hmac = self.iv_hmac(&iv[IV_HMAC_LEN..], plaintext)?;
        iv[..IV_HMAC_LEN].copy_from_slice(&hmac);

        let key = GenericArray::from_slice(&self.key);
        let mut sealed_iv = GenericArray::clone_from_slice(&iv);
        Aes256::new(key).encrypt_block(&mut sealed_iv);

        let body = Aes256CbcEnc::new(key, GenericArray::from_slice(&iv))
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(BLOCK_LEN + body.len());
        out.extend_from_slice(&sealed_iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// # Errors
    /// - `ProtocolError::DecryptionFailure` for short, misaligned or badly padded input
    /// - `ProtocolError::AuthenticationTag` when the IV does not authenticate the plaintext
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 2 * BLOCK_LEN || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(ProtocolError::DecryptionFailure);
        }

        let key = GenericArray::from_slice(&self.key);
        let mut iv = GenericArray::clone_from_slice(&ciphertext[..BLOCK_LEN]);
        Aes256::new(key).decrypt_block(&mut iv);

        let plaintext = Aes256CbcDec::new(key, &iv)
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext[BLOCK_LEN..])
            .map_err(|_| ProtocolError::DecryptionFailure)?;

        let expected = self.iv_hmac(&iv[IV_HMAC_LEN..], &plaintext)?;
        if !bool::from(expected[..].ct_eq(&iv[..IV_HMAC_LEN])) {
            return Err(ProtocolError::AuthenticationTag);
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn context() -> CipherContext {
        let mut key = [0u8; SESSION_KEY_LEN];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        CipherContext::new(&key)
    }

    #[test]
    fn test_ciphertext_layout() {
        let ctx = context();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let ct = ctx.encrypt(&vec![0x5A; len]).unwrap();
            assert_eq!(ct.len(), BLOCK_LEN + (len / BLOCK_LEN + 1) * BLOCK_LEN);
            assert!(ct.len() <= CipherContext::max_encrypted_len(len));
        }
    }

    #[test]
    fn test_iv_randomized() {
        let ctx = context();
        let a = ctx.encrypt(b"same").unwrap();
        let b = ctx.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(ctx.decrypt(&a).unwrap(), ctx.decrypt(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ct = context().encrypt(b"payload").unwrap();
        let other = CipherContext::new(&[7u8; SESSION_KEY_LEN]);
        assert!(other.decrypt(&ct).is_err());
    }

    #[test]
    fn test_short_or_misaligned_input() {
        let ctx = context();
        assert!(matches!(ctx.decrypt(&[0u8; 16]), Err(ProtocolError::DecryptionFailure)));
        assert!(matches!(ctx.decrypt(&[0u8; 33]), Err(ProtocolError::DecryptionFailure)));
    }

    #[test]
    fn test_session_key_is_random() {
        assert_ne!(*generate_session_key(), *generate_session_key());
    }
}
