//! Recipient key material.
//!
//! Public key file:
//!
//! ```json
//! {"emails": ["ops@example.com"], "public_key": "<base64 X25519 public key>"}
//! ```
//!
//! Secret key file:
//!
//! ```json
//! {"emails": ["ops@example.com"], "secret_key": "<base64 X25519 secret key>"}
//! ```

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{ExportError, Result};
use crate::security::SecureString;

/// Length of X25519 keys in bytes.
pub const KEY_LEN: usize = 32;

const ALGORITHM: &str = "x25519";

#[derive(Serialize, Deserialize)]
struct PublicKeyFile {
    #[serde(default = "default_algorithm")]
    algorithm: String,
    #[serde(default)]
    emails: Vec<String>,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct SecretKeyFile {
    #[serde(default = "default_algorithm")]
    algorithm: String,
    #[serde(default)]
    emails: Vec<String>,
    secret_key: String,
}

fn default_algorithm() -> String {
    ALGORITHM.to_string()
}

/// SHA-256 of a raw public key.
pub fn key_digest(public_key: &[u8; KEY_LEN]) -> [u8; 32] {
    Sha256::digest(public_key).into()
}

fn decode_key(label: &str, encoded: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| ExportError::key_import(label, format!("invalid base64: {e}")))?,
    );
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if bytes.len() != KEY_LEN {
        return Err(ExportError::key_import(
            label,
            format!("expected a {KEY_LEN}-byte key, got {} bytes", bytes.len()),
        ));
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn check_algorithm(label: &str, algorithm: &str) -> Result<()> {
    if algorithm != ALGORITHM {
        return Err(ExportError::key_import(
            label,
            format!("unsupported key algorithm '{algorithm}'"),
        ));
    }
    Ok(())
}

/// A recipient's public key and identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientKey {
    public_key: [u8; KEY_LEN],
    fingerprint_id: String,
    emails: Vec<String>,
}

impl RecipientKey {
    pub fn from_bytes(public_key: [u8; KEY_LEN], emails: Vec<String>) -> Result<Self> {
        // Low-order points give an all-zero shared secret for every scalar
        let check_scalar = StaticSecret::from([0x5a; KEY_LEN]);
        if !check_scalar
            .diffie_hellman(&PublicKey::from(public_key))
            .was_contributory()
        {
            return Err(ExportError::key_import(
                "<bytes>",
                "public key is a low-order X25519 point",
            ));
        }
        Ok(Self {
            fingerprint_id: hex::encode_upper(key_digest(&public_key)),
            public_key,
            emails,
        })
    }

    /// Parses a public key file. `label` names the source in errors.
    pub fn parse(label: &str, text: &str) -> Result<Self> {
        let file: PublicKeyFile = serde_json::from_str(text)
            .map_err(|e| ExportError::key_import(label, format!("malformed key file: {e}")))?;
        check_algorithm(label, &file.algorithm)?;
        let key = decode_key(label, &file.public_key)?;
        Self::from_bytes(*key, file.emails).map_err(|e| match e {
            ExportError::KeyImport { message, .. } => ExportError::key_import(label, message),
            other => other,
        })
    }

    /// Serializes to a public key file.
    pub fn to_key_file(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&PublicKeyFile {
            algorithm: default_algorithm(),
            emails: self.emails.clone(),
            public_key: STANDARD.encode(self.public_key),
        })?)
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    /// Uppercase hex SHA-256 of the public key.
    pub fn fingerprint_id(&self) -> &str {
        &self.fingerprint_id
    }

    pub fn emails(&self) -> &[String] {
        &self.emails
    }

    /// Identities for audit logs: the emails, or the fingerprint when none.
    pub fn identities(&self) -> Vec<String> {
        if self.emails.is_empty() {
            vec![self.fingerprint_id.clone()]
        } else {
            self.emails.clone()
        }
    }
}

/// A recipient's secret key. Zeroized on drop.
#[derive(Clone)]
pub struct RecipientSecret {
    secret: StaticSecret,
    emails: Vec<String>,
}

impl std::fmt::Debug for RecipientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientSecret")
            .field("secret", &"***")
            .field("emails", &self.emails)
            .finish()
    }
}

impl RecipientSecret {
    /// Generates a fresh key pair from the OS random source.
    pub fn generate(emails: Vec<String>) -> Self {
        Self {
            secret: StaticSecret::from(*random_key()),
            emails,
        }
    }

    /// Parses a secret key file. `label` names the source in errors.
    pub fn parse(label: &str, text: &str) -> Result<Self> {
        let file: SecretKeyFile = serde_json::from_str(text)
            .map_err(|e| ExportError::key_import(label, format!("malformed secret key file: {e}")))?;
        check_algorithm(label, &file.algorithm)?;
        let key = decode_key(label, &file.secret_key)?;
        Ok(Self {
            secret: StaticSecret::from(*key),
            emails: file.emails,
        })
    }

    /// Serializes to a secret key file.
    pub fn to_key_file(&self) -> Result<SecureString> {
        let encoded = Zeroizing::new(STANDARD.encode(self.secret.to_bytes()));
        let text = serde_json::to_string_pretty(&SecretKeyFile {
            algorithm: default_algorithm(),
            emails: self.emails.clone(),
            secret_key: encoded.to_string(),
        })?;
        Ok(SecureString::new(text))
    }

    /// The matching public key.
    pub fn recipient(&self) -> Result<RecipientKey> {
        RecipientKey::from_bytes(
            PublicKey::from(&self.secret).to_bytes(),
            self.emails.clone(),
        )
    }

    pub(crate) fn diffie_hellman(&self, public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(public)
    }
}

/// 32 random bytes from the OS random source.
pub(crate) fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *key);
    key
}
