//! Symmetric artifact encryption
//!
//! Every encrypted artifact is laid out as `salt(16) || iv(16) || ciphertext`.
//! The 256-bit key is derived from the caller's secret and the per-call salt
//! with Argon2id. The payload is sealed with AES-256-GCM in the STREAM
//! construction: 64 KiB plaintext chunks, each followed by its own 16-byte
//! tag, with the nonce prefix taken from the IV. Files are processed one
//! chunk at a time, a wrong key fails authentication on the first chunk, and
//! a truncated artifact fails on its last.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{BackstopError, Result};

/// AES-256-GCM with a 128-bit nonce
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;
const TAG_LEN: usize = 16;

/// Plaintext bytes per STREAM chunk
pub const CHUNK_LEN: usize = 64 * 1024;
const SEALED_CHUNK_LEN: usize = CHUNK_LEN + TAG_LEN;
/// IV bytes used as STREAM nonce prefix; the rest of the nonce is the
/// 32-bit chunk counter and the last-chunk flag
const STREAM_NONCE_LEN: usize = IV_LEN - 5;

pub const MIN_KEY_LEN: usize = 32;
pub const MAX_KEY_LEN: usize = 512;

/// Suffix appended to encrypted artifacts
pub const ENCRYPTED_SUFFIX: &str = "enc";

const WEAK_PATTERNS: &[&str] = &[
    "password", "123456", "qwerty", "abcdef", "letmein", "changeme", "secret", "admin",
];

/// Argon2id cost parameters
///
/// These are not stored in the artifact, so they must stay fixed for the
/// lifetime of any artifact encrypted with them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

/// Result of [`EncryptionEngine::validate_key`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeyValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Key generation, validation and authenticated encryption of bytes/files
#[derive(Debug, Clone, Default)]
pub struct EncryptionEngine {
    params: KdfParams,
}

impl EncryptionEngine {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Generate a fresh random secret (64 URL-safe characters)
    pub fn generate_key(&self, context: &str) -> String {
        let mut bytes = Zeroizing::new([0u8; 48]);
        OsRng.fill_bytes(&mut bytes[..]);
        debug!(context = %context, "Generated new encryption key");
        URL_SAFE_NO_PAD.encode(&bytes[..])
    }

    /// Check a caller-supplied secret for length and obvious weakness
    pub fn validate_key(&self, secret: &str) -> KeyValidation {
        let mut errors = Vec::new();
        let len = secret.chars().count();

        if len < MIN_KEY_LEN {
            errors.push(format!(
                "Key must be at least {MIN_KEY_LEN} characters long"
            ));
        }
        if len > MAX_KEY_LEN {
            errors.push(format!("Key must be at most {MAX_KEY_LEN} characters long"));
        }
        if longest_run(secret) >= 6 {
            errors.push("Key contains long runs of a repeated character".to_string());
        }
        let lower = secret.to_ascii_lowercase();
        if let Some(pattern) = WEAK_PATTERNS.iter().find(|p| lower.contains(*p)) {
            errors.push(format!("Key contains a common weak pattern ('{pattern}')"));
        }

        KeyValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Encrypt `plaintext`, returning `salt || iv || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8], secret: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
        self.seal_stream(plaintext, &mut out, secret)?;
        Ok(out)
    }

    /// Inverse of [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, data: &[u8], secret: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        self.open_stream(data, &mut out, secret)?;
        Ok(out)
    }

    /// Encrypt everything `input` yields into `output`
    ///
    /// # Returns
    /// Bytes written, header included
    pub fn seal_stream<R: Read, W: Write>(
        &self,
        mut input: R,
        output: &mut W,
        secret: &str,
    ) -> Result<u64> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let cipher = self.cipher(secret, &salt)?;
        let mut sealer =
            EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&iv[..STREAM_NONCE_LEN]));
        output.write_all(&salt)?;
        output.write_all(&iv)?;
        let mut written = HEADER_LEN as u64;

        let mut current = Zeroizing::new(vec![0u8; CHUNK_LEN]);
        let mut next = Zeroizing::new(vec![0u8; CHUNK_LEN]);
        let mut filled = read_chunk(&mut input, &mut current[..])?;
        loop {
            let ahead = if filled == CHUNK_LEN {
                read_chunk(&mut input, &mut next[..])?
            } else {
                0
            };
            if ahead == 0 {
                let sealed = sealer
                    .encrypt_last(&current[..filled])
                    .map_err(|e| BackstopError::encryption(format!("Encryption failed: {e}")))?;
                output.write_all(&sealed)?;
                return Ok(written + sealed.len() as u64);
            }

            let sealed = sealer
                .encrypt_next(&current[..filled])
                .map_err(|e| BackstopError::encryption(format!("Encryption failed: {e}")))?;
            output.write_all(&sealed)?;
            written += sealed.len() as u64;
            std::mem::swap(&mut current, &mut next);
            filled = ahead;
        }
    }

    /// Decrypt `salt || iv || ciphertext` from `input` into `output`
    ///
    /// Chunks are written as they authenticate, so on error `output` may
    /// hold a plaintext prefix the caller must discard.
    ///
    /// # Returns
    /// Plaintext bytes written
    pub fn open_stream<R: Read, W: Write>(
        &self,
        mut input: R,
        output: &mut W,
        secret: &str,
    ) -> Result<u64> {
        let mut header = [0u8; HEADER_LEN];
        if read_chunk(&mut input, &mut header)? < HEADER_LEN {
            return Err(BackstopError::decryption(
                "Input is too short to contain an encryption header",
            ));
        }
        let (salt, iv) = header.split_at(SALT_LEN);

        let cipher = self.cipher(secret, salt)?;
        let mut opener =
            DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&iv[..STREAM_NONCE_LEN]));
        let mut written = 0u64;

        let mut current = vec![0u8; SEALED_CHUNK_LEN];
        let mut next = vec![0u8; SEALED_CHUNK_LEN];
        let mut filled = read_chunk(&mut input, &mut current)?;
        loop {
            let ahead = if filled == SEALED_CHUNK_LEN {
                read_chunk(&mut input, &mut next)?
            } else {
                0
            };
            if ahead == 0 {
                let plain = Zeroizing::new(
                    opener
                        .decrypt_last(&current[..filled])
                        .map_err(|_| BackstopError::decryption("invalid key or corrupted data"))?,
                );
                output.write_all(&plain)?;
                return Ok(written + plain.len() as u64);
            }

            let plain = Zeroizing::new(
                opener
                    .decrypt_next(&current[..filled])
                    .map_err(|_| BackstopError::decryption("invalid key or corrupted data"))?,
            );
            output.write_all(&plain)?;
            written += plain.len() as u64;
            std::mem::swap(&mut current, &mut next);
            filled = ahead;
        }
    }

    /// Encrypt `src` into `dst` on a blocking worker
    pub async fn encrypt_file(&self, src: &Path, dst: &Path, secret: &str) -> Result<u64> {
        let engine = self.clone();
        let secret = Zeroizing::new(secret.to_string());
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        run_blocking(move || {
            let input = BufReader::new(File::open(&src)?);
            let mut output = BufWriter::new(File::create(&dst)?);
            let written = engine.seal_stream(input, &mut output, &secret)?;
            output.flush()?;
            Ok(written)
        })
        .await
    }

    /// Decrypt `src` into `dst` on a blocking worker
    ///
    /// `dst` is removed again if any chunk fails to authenticate.
    pub async fn decrypt_file(&self, src: &Path, dst: &Path, secret: &str) -> Result<u64> {
        let engine = self.clone();
        let secret = Zeroizing::new(secret.to_string());
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        run_blocking(move || {
            let input = BufReader::new(File::open(&src)?);
            let mut output = BufWriter::new(File::create(&dst)?);
            let result = match engine.open_stream(input, &mut output, &secret) {
                Ok(written) => output.flush().map(|_| written).map_err(BackstopError::from),
                Err(e) => Err(e),
            };
            if result.is_err() {
                drop(output);
                let _ = std::fs::remove_file(&dst);
            }
            result
        })
        .await
    }

    /// Encrypt `path` to `path.enc` and remove the plaintext
    pub async fn seal_in_place(&self, path: &Path, secret: &str) -> Result<PathBuf> {
        let sealed_path = with_encrypted_suffix(path);
        self.encrypt_file(path, &sealed_path, secret).await?;
        tokio::fs::remove_file(path).await?;
        Ok(sealed_path)
    }

    fn cipher(&self, secret: &str, salt: &[u8]) -> Result<Aes256Gcm16> {
        let key = self.derive_key(secret, salt)?;
        Aes256Gcm16::new_from_slice(&key[..])
            .map_err(|e| BackstopError::encryption(format!("Failed to create cipher: {e}")))
    }

    fn derive_key(&self, secret: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(32),
        )
        .map_err(|e| BackstopError::encryption(format!("Invalid Argon2 parameters: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(secret.as_bytes(), salt, &mut key[..])
            .map_err(|e| BackstopError::encryption(format!("Key derivation failed: {e}")))?;
        Ok(key)
    }
}

/// `foo.tar` -> `foo.tar.enc`
pub fn with_encrypted_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// True if the file name carries the encrypted suffix
pub fn has_encrypted_suffix(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ENCRYPTED_SUFFIX)
}

/// Shortest header [`looks_encrypted`] will judge
const MIN_SNIFF_LEN: usize = 16;
const MAX_SNIFF_LEN: usize = 512;

/// Best-effort guess that `header` is ciphertext: at least half of its first
/// 512 bytes are non-printable. Only meaningful after known file signatures
/// have been ruled out.
pub fn looks_encrypted(header: &[u8]) -> bool {
    let sample = &header[..header.len().min(MAX_SNIFF_LEN)];
    if sample.len() < MIN_SNIFF_LEN {
        return false;
    }
    let non_printable = sample
        .iter()
        .filter(|b| !(b.is_ascii_graphic() || matches!(b, b' ' | b'\t' | b'\n' | b'\r')))
        .count();
    non_printable * 2 >= sample.len()
}

/// Fill `buf` from `reader`, stopping short only at end of input
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn longest_run(s: &str) -> usize {
    let mut best = 0;
    let mut current = 0;
    let mut prev = None;
    for c in s.chars() {
        if Some(c) == prev {
            current += 1;
        } else {
            current = 1;
            prev = Some(c);
        }
        best = best.max(current);
    }
    best
}

pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        BackstopError::Io(std::io::Error::other(format!("blocking task failed: {e}")))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(KdfParams::new(1024, 1, 1))
    }

    #[test]
    fn test_encrypt_decrypt() {
        let engine = engine();
        let secret = engine.generate_key("test");
        let plaintext = b"CREATE TABLE students (id serial primary key);";

        let sealed = engine.encrypt(plaintext, &secret).unwrap();
        assert_eq!(sealed.len(), HEADER_LEN + plaintext.len() + TAG_LEN);

        let opened = engine.decrypt(&sealed, &secret).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_salt_and_iv_are_fresh() {
        let engine = engine();
        let secret = engine.generate_key("test");
        let a = engine.encrypt(b"same", &secret).unwrap();
        let b = engine.encrypt(b"same", &secret).unwrap();
        assert_ne!(&a[..SALT_LEN], &b[..SALT_LEN]);
        assert_ne!(&a[SALT_LEN..HEADER_LEN], &b[SALT_LEN..HEADER_LEN]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let engine = engine();
        let sealed = engine.encrypt(b"payload", &engine.generate_key("a")).unwrap();
        let result = engine.decrypt(&sealed, &engine.generate_key("b"));
        assert!(matches!(result, Err(BackstopError::DecryptionFailed(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let engine = engine();
        let secret = engine.generate_key("test");
        let mut sealed = engine.encrypt(b"payload bytes", &secret).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(engine.decrypt(&sealed, &secret).is_err());
    }

    #[test]
    fn test_truncated_header_fails() {
        let engine = engine();
        let result = engine.decrypt(&[0u8; 20], "x".repeat(40).as_str());
        assert!(matches!(result, Err(BackstopError::DecryptionFailed(_))));
    }

    #[test]
    fn test_empty_and_binary_payloads() {
        let engine = engine();
        let secret = engine.generate_key("test");
        for payload in [Vec::new(), (0..=255u8).cycle().take(70_000).collect::<Vec<_>>()] {
            let sealed = engine.encrypt(&payload, &secret).unwrap();
            assert_eq!(engine.decrypt(&sealed, &secret).unwrap(), payload);
        }
    }

    #[test]
    fn test_generated_key_is_valid() {
        let engine = engine();
        let key = engine.generate_key("backup");
        assert_eq!(key.len(), 64);
        assert!(engine.validate_key(&key).valid);
    }

    #[test]
    fn test_validate_key_rejections() {
        let engine = engine();

        let short = engine.validate_key("tooshort");
        assert!(!short.valid);
        assert!(short.errors[0].contains("at least"));

        let long = engine.validate_key(&"ab".repeat(300));
        assert!(!long.valid);

        let repeated = engine.validate_key(&"a".repeat(40));
        assert!(!repeated.valid);

        let weak = engine.validate_key("MyPassword-for-the-school-system-2024!");
        assert!(!weak.valid);
        assert!(weak.errors.iter().any(|e| e.contains("password")));
    }

    #[tokio::test]
    async fn test_file_roundtrip_and_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine();
        let secret = engine.generate_key("test");
        let plain = dir.path().join("dump.sql.gz");
        std::fs::write(&plain, b"some artifact").unwrap();

        let sealed = engine.seal_in_place(&plain, &secret).await.unwrap();
        assert!(!plain.exists());
        assert!(has_encrypted_suffix(&sealed));
        assert!(sealed.to_string_lossy().ends_with("dump.sql.gz.enc"));

        let restored = dir.path().join("restored.sql.gz");
        engine.decrypt_file(&sealed, &restored, &secret).await.unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"some artifact");
    }

    #[test]
    fn test_looks_encrypted_heuristic() {
        assert!(!looks_encrypted(b"-- PostgreSQL database dump\n"));
        assert!(!looks_encrypted(b"short"));
        let binary: Vec<u8> = (0x00..0x10).collect();
        assert!(looks_encrypted(&binary));

        let engine = engine();
        let sealed = engine.encrypt(&[0u8; 1024], &engine.generate_key("test")).unwrap();
        assert!(looks_encrypted(&sealed));
        let text = "id,grade\n1,A\n".repeat(40);
        assert!(!looks_encrypted(text.as_bytes()));
    }

    #[tokio::test]
    async fn test_large_file_is_chunked() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine();
        let secret = engine.generate_key("test");
        let payload: Vec<u8> = (0..2 * CHUNK_LEN + 123).map(|i| (i % 251) as u8).collect();
        let plain = dir.path().join("files.tar.gz");
        std::fs::write(&plain, &payload).unwrap();

        let sealed = dir.path().join("files.tar.gz.enc");
        let written = engine.encrypt_file(&plain, &sealed, &secret).await.unwrap();
        assert_eq!(written, (HEADER_LEN + payload.len() + 3 * TAG_LEN) as u64);
        assert_eq!(std::fs::metadata(&sealed).unwrap().len(), written);

        let restored = dir.path().join("restored.tar.gz");
        let opened = engine.decrypt_file(&sealed, &restored, &secret).await.unwrap();
        assert_eq!(opened, payload.len() as u64);
        assert_eq!(std::fs::read(&restored).unwrap(), payload);
    }

    #[test]
    fn test_chunk_boundary_payload() {
        let engine = engine();
        let secret = engine.generate_key("test");
        let payload = vec![7u8; CHUNK_LEN];
        let sealed = engine.encrypt(&payload, &secret).unwrap();
        assert_eq!(sealed.len(), HEADER_LEN + CHUNK_LEN + TAG_LEN);
        assert_eq!(engine.decrypt(&sealed, &secret).unwrap(), payload);
    }

    #[test]
    fn test_dropped_final_chunk_fails() {
        let engine = engine();
        let secret = engine.generate_key("test");
        let payload = vec![1u8; 2 * CHUNK_LEN + 10];
        let sealed = engine.encrypt(&payload, &secret).unwrap();

        let truncated = &sealed[..HEADER_LEN + 2 * SEALED_CHUNK_LEN];
        let result = engine.decrypt(truncated, &secret);
        assert!(matches!(result, Err(BackstopError::DecryptionFailed(_))));
    }

    #[tokio::test]
    async fn test_wrong_key_file_leaves_no_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine();
        let plain = dir.path().join("dump.sql.gz");
        std::fs::write(&plain, vec![3u8; CHUNK_LEN + 1]).unwrap();
        let sealed = engine
            .seal_in_place(&plain, &engine.generate_key("a"))
            .await
            .unwrap();

        let restored = dir.path().join("restored.sql.gz");
        let err = engine
            .decrypt_file(&sealed, &restored, &engine.generate_key("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackstopError::DecryptionFailed(_)));
        assert!(!restored.exists());
    }
}
