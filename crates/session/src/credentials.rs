//! Encrypted session credential file.
//!
//! The file holds one line, `hex(nonce):hex(tag):hex(ciphertext)`, produced
//! with AES-256-GCM under a key derived from the configured secret with
//! Argon2id. The salt is a fixed application constant, so the same secret
//! always yields the same key and a restarted process can read files written
//! by an earlier one.

use crate::error::{CredentialError, CredentialResult};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tgsync_core::config::MIN_SESSION_SECRET_LEN;
use tokio::io::AsyncWriteExt;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const KDF_SALT: &[u8] = b"tgsync-session-credentials-v1";
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

/// Derived keys by secret. Derivation is deliberately slow, so it runs once
/// per distinct secret per process.
static KEY_CACHE: LazyLock<Mutex<HashMap<String, [u8; KEY_LEN]>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Default credential file location: `<config dir>/tgsync/session.enc`.
pub fn default_session_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tgsync")
        .join("session.enc")
}

fn derive_key(secret: &str) -> CredentialResult<[u8; KEY_LEN]> {
    if let Some(key) = lock_cache().get(secret) {
        return Ok(*key);
    }

    let params = Params::new(
        KDF_MEMORY_KIB,
        KDF_ITERATIONS,
        KDF_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(secret.as_bytes(), KDF_SALT, &mut key)
        .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;

    lock_cache().insert(secret.to_string(), key);
    Ok(key)
}

fn lock_cache() -> std::sync::MutexGuard<'static, HashMap<String, [u8; KEY_LEN]>> {
    // A poisoned cache only means another thread panicked mid-insert; the
    // map itself is still consistent.
    KEY_CACHE.lock().unwrap_or_else(|e| e.into_inner())
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &str) -> CredentialResult<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CredentialError::Encryption(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| CredentialError::Encryption(e.to_string()))?;

    Ok(format!(
        "{}:{}:{}",
        hex::encode(nonce),
        hex::encode(tag),
        hex::encode(&buffer)
    ))
}

fn decrypt(key: &[u8; KEY_LEN], payload: &str) -> CredentialResult<String> {
    let mut parts = payload.trim().split(':');
    let (Some(nonce_hex), Some(tag_hex), Some(data_hex), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CredentialError::Decryption(
            "expected 'nonce:tag:ciphertext'".to_string(),
        ));
    };

    let nonce = decode_part(nonce_hex, "nonce")?;
    let tag = decode_part(tag_hex, "tag")?;
    let mut buffer = decode_part(data_hex, "ciphertext")?;
    if nonce.len() != NONCE_LEN {
        return Err(CredentialError::Decryption(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(CredentialError::Decryption(format!(
            "tag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CredentialError::Decryption(e.to_string()))?;
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            b"",
            &mut buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|_| CredentialError::Decryption("authentication tag mismatch".to_string()))?;

    String::from_utf8(buffer)
        .map_err(|_| CredentialError::Decryption("plaintext is not UTF-8".to_string()))
}

fn decode_part(part: &str, what: &str) -> CredentialResult<Vec<u8>> {
    hex::decode(part).map_err(|e| CredentialError::Decryption(format!("invalid {what} hex: {e}")))
}

/// Encrypted, owner-only store for the upstream session token.
pub struct CredentialStore {
    secret: String,
    path: PathBuf,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("secret", &"[REDACTED]")
            .field("path", &self.path)
            .finish()
    }
}

impl CredentialStore {
    /// Create a store for `path`. Fails before touching the filesystem when
    /// the secret is shorter than the minimum length.
    pub fn new(secret: impl Into<String>, path: impl Into<PathBuf>) -> CredentialResult<Self> {
        let secret = secret.into();
        if secret.chars().count() < MIN_SESSION_SECRET_LEN {
            return Err(CredentialError::Config(format!(
                "session secret must be at least {MIN_SESSION_SECRET_LEN} characters"
            )));
        }
        Ok(Self {
            secret,
            path: path.into(),
        })
    }

    /// Create a store from configuration, falling back to the default path.
    pub fn from_config(config: &tgsync_core::config::SessionConfig) -> CredentialResult<Self> {
        let secret = config.require_secret().map_err(CredentialError::Config)?;
        let path = config.path.clone().unwrap_or_else(default_session_path);
        Self::new(secret, path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn key(&self) -> CredentialResult<[u8; KEY_LEN]> {
        let secret = self.secret.clone();
        tokio::task::spawn_blocking(move || derive_key(&secret))
            .await
            .map_err(|e| CredentialError::KeyDerivation(format!("derivation task failed: {e}")))?
    }

    /// Encrypt and persist the session token, replacing any previous one.
    pub async fn save(&self, plaintext: &str) -> CredentialResult<()> {
        let key = self.key().await?;
        let payload = encrypt(&key, plaintext)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !tokio::fs::try_exists(parent).await?
        {
            // Only directories created here are made owner-only
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o700);
            builder.create(parent).await?;
        }

        // Write a fresh owner-only file and move it into place, so the token
        // never sits in a file with wider permissions
        let tmp = self.path.with_extension("enc.tmp");
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await?;
        file.write_all(payload.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::info!(path = %self.path.display(), "Saved encrypted session");
        Ok(())
    }

    /// Load and decrypt the session token. Returns `None` when no file exists.
    pub async fn load(&self) -> CredentialResult<Option<String>> {
        let payload = match tokio::fs::read_to_string(&self.path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = self.key().await?;
        decrypt(&key, &payload).map(Some)
    }

    /// Remove the credential file. A missing file is not an error.
    pub async fn delete(&self) -> CredentialResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Deleted session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
