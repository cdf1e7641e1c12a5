//! Per-buffer symmetric encryption of portal records.
//!
//! Each buffer is encrypted with AES-256-CBC (PKCS#7 padding) under a key
//! derived from the session's shared secret, with a fresh random IV. The
//! IV travels as `key_size` bytes, of which the cipher uses the leading
//! block. Encrypted record layout:
//! `{len: i32}{iv: key_size bytes}{ciphertext: len - key_size bytes}`.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::portal::PortalConfig;
use crate::utils::{ErrorKind, StrataError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Supported key size in bytes.
pub(crate) const KEY_SIZE: usize = 32;

const BLOCK_SIZE: usize = 16;

/// Extra bytes an encrypted record may carry beyond its plaintext: the IV
/// plus at most one padding block.
pub const IV_CIPHER_LEN: usize = KEY_SIZE + BLOCK_SIZE;

/// Hard cap on a single encrypted record accepted from the wire.
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Secret material agreed on by both ends of a session, out of band.
#[derive(Clone)]
pub struct SessionKeys {
    pub shared_secret: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Cipher state of one session.
#[derive(Clone)]
pub struct BufferCrypt {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for BufferCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BufferCrypt {{ .. }}")
    }
}

fn crypt_err(msg: impl ToString) -> StrataError {
    StrataError::new(ErrorKind::Encryption, msg)
}

impl BufferCrypt {
    /// Derives the session key by iterated SHA-256 over salt and secret.
    pub fn derive(
        keys: &SessionKeys,
        config: &PortalConfig,
    ) -> Result<Self, StrataError> {
        if config.key_size != KEY_SIZE {
            return Err(crypt_err(format!(
                "unsupported key size {}",
                config.key_size
            )));
        }
        if keys.salt.len() != config.salt_size {
            return Err(crypt_err(format!(
                "salt of {} bytes, expect {}",
                keys.salt.len(),
                config.salt_size
            )));
        }
        if keys.shared_secret.is_empty() {
            return Err(crypt_err("empty shared secret"));
        }

        let mut digest = Sha256::new()
            .chain_update(&keys.salt)
            .chain_update(&keys.shared_secret)
            .finalize();
        for _ in 1..config.num_hash_rounds {
            digest = Sha256::new()
                .chain_update(digest)
                .chain_update(&keys.shared_secret)
                .finalize();
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Ok(BufferCrypt { key })
    }

    /// Encrypts one buffer into `iv || ciphertext`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, StrataError> {
        let mut iv = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv[..BLOCK_SIZE])
            .map_err(crypt_err)?
            .encrypt_padded_vec_mut::<Pkcs7>(plain);

        let mut record = Vec::with_capacity(KEY_SIZE + cipher.len());
        record.extend_from_slice(&iv);
        record.extend_from_slice(&cipher);
        Ok(record)
    }

    /// Splits `iv || ciphertext` and decrypts.
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>, StrataError> {
        if record.len() < KEY_SIZE + BLOCK_SIZE {
            return Err(crypt_err(format!(
                "encrypted record of {} bytes too short",
                record.len()
            )));
        }
        let (iv, cipher) = record.split_at(KEY_SIZE);
        Aes256CbcDec::new_from_slices(&self.key, &iv[..BLOCK_SIZE])
            .map_err(crypt_err)?
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|_| crypt_err("decryption failed, bad key or padding"))
    }
}

/// Encrypts one buffer and writes it as a length-prefixed record.
pub(crate) async fn send_record<W>(
    conn: &mut W,
    crypt: &BufferCrypt,
    plain: &[u8],
) -> Result<(), StrataError>
where
    W: AsyncWriteExt + Unpin,
{
    let record = crypt.encrypt(plain)?;
    let len = i32::try_from(record.len())
        .map_err(|_| crypt_err("encrypted record too large"))?;
    conn.write_i32(len).await?;
    conn.write_all(&record).await?;
    Ok(())
}

/// Reads one length-prefixed record and decrypts it.
pub(crate) async fn recv_record<R>(
    conn: &mut R,
    crypt: &BufferCrypt,
) -> Result<Vec<u8>, StrataError>
where
    R: AsyncReadExt + Unpin,
{
    let len = conn.read_i32().await?;
    let len = usize::try_from(len).ok().filter(|l| *l <= MAX_RECORD_LEN);
    let Some(len) = len else {
        return Err(StrataError::new(
            ErrorKind::PortalProtocol,
            "invalid encrypted record length",
        ));
    };
    let mut record = vec![0u8; len];
    conn.read_exact(&mut record).await?;
    crypt.decrypt(&record)
}

#[cfg(test)]
mod crypt_tests {
    use super::*;

    fn keys(secret: &[u8]) -> SessionKeys {
        SessionKeys {
            shared_secret: secret.to_vec(),
            salt: b"saltsalt".to_vec(),
        }
    }

    #[test]
    fn fresh_iv_per_buffer() -> Result<(), StrataError> {
        let crypt = BufferCrypt::derive(&keys(b"s3cret"), &PortalConfig::default())?;
        let plain = b"twelve bytes";
        let a = crypt.encrypt(plain)?;
        let b = crypt.encrypt(plain)?;
        assert_ne!(a, b);
        assert_eq!(a.len(), KEY_SIZE + BLOCK_SIZE);
        assert_eq!(crypt.decrypt(&a)?, plain);
        assert_eq!(crypt.decrypt(&b)?, plain);
        Ok(())
    }

    #[test]
    fn wrong_key_or_garbage() -> Result<(), StrataError> {
        let config = PortalConfig::default();
        let ours = BufferCrypt::derive(&keys(b"s3cret"), &config)?;
        let theirs = BufferCrypt::derive(&keys(b"other"), &config)?;
        let record = ours.encrypt(&[7u8; 1000])?;
        // a wrong key yields garbage or a padding error, never the input
        assert!(theirs.decrypt(&record).map_or(true, |p| p != [7u8; 1000]));
        assert!(ours
            .decrypt(&record[..20])
            .is_err_and(|e| e.kind() == ErrorKind::Encryption));
        Ok(())
    }

    #[test]
    fn derive_checks_inputs() {
        let config = PortalConfig::default();
        let mut bad_salt = keys(b"s3cret");
        bad_salt.salt = vec![1, 2, 3];
        assert!(BufferCrypt::derive(&bad_salt, &config).is_err());
        assert!(BufferCrypt::derive(&keys(b""), &config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn records_over_a_pipe() -> Result<(), StrataError> {
        let crypt = BufferCrypt::derive(&keys(b"s3cret"), &PortalConfig::default())?;
        let (mut tx, mut rx) = tokio::io::duplex(1 << 16);
        send_record(&mut tx, &crypt, b"").await?;
        send_record(&mut tx, &crypt, &[9u8; 4000]).await?;
        assert!(recv_record(&mut rx, &crypt).await?.is_empty());
        assert_eq!(recv_record(&mut rx, &crypt).await?, vec![9u8; 4000]);

        tx.write_i32(-5).await?;
        assert!(recv_record(&mut rx, &crypt)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::PortalProtocol));
        Ok(())
    }
}
