//! Run-scoped keyring.
//!
//! Each export run imports its recipient keys into a fresh private directory
//! that is removed when the keyring is closed or dropped. Imports never touch
//! any shared key store.

use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, info};

use super::keys::RecipientKey;
use crate::error::{ExportError, Result};

/// Recipient keys imported for one run.
#[derive(Debug)]
pub struct Keyring {
    home: TempDir,
    recipients: Vec<RecipientKey>,
}

impl Keyring {
    /// Creates an empty keyring in a new temporary directory.
    pub fn create() -> Result<Self> {
        let home = tempfile::Builder::new()
            .prefix("term-export-keyring-")
            .tempdir()
            .map_err(|e| ExportError::key_import("<keyring>", format!("cannot create keyring: {e}")))?;
        debug!(home = %home.path().display(), "Created keyring");
        Ok(Self {
            home,
            recipients: Vec::new(),
        })
    }

    /// The keyring directory.
    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// Parses and imports key material. Importing a key twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`ExportError::KeyImport`] naming `label` when the material is not a
    /// valid public key file or cannot be stored.
    pub fn import(&mut self, label: &str, material: &str) -> Result<RecipientKey> {
        let key = RecipientKey::parse(label, material)?;
        if self
            .recipients
            .iter()
            .any(|k| k.fingerprint_id() == key.fingerprint_id())
        {
            debug!(fingerprint = key.fingerprint_id(), "Key already imported");
            return Ok(key);
        }

        let stored = self.home.path().join(format!("{}.pub", key.fingerprint_id()));
        std::fs::write(&stored, key.to_key_file()?)
            .map_err(|e| ExportError::key_import(label, format!("cannot store key: {e}")))?;

        info!(
            key = label,
            fingerprint = key.fingerprint_id(),
            identities = ?key.identities(),
            "Imported recipient key"
        );
        self.recipients.push(key.clone());
        Ok(key)
    }

    /// Reads and imports a key file.
    pub fn import_file(&mut self, path: &Path) -> Result<RecipientKey> {
        let label = path.display().to_string();
        let material = std::fs::read_to_string(path)
            .map_err(|e| ExportError::key_import(label.as_str(), format!("cannot read key file: {e}")))?;
        self.import(&label, &material)
    }

    /// Imported keys in import order.
    pub fn recipients(&self) -> &[RecipientKey] {
        &self.recipients
    }

    /// Identities of every imported key.
    pub fn identities(&self) -> Vec<String> {
        self.recipients
            .iter()
            .flat_map(RecipientKey::identities)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Removes the keyring directory.
    pub fn close(self) -> Result<()> {
        self.home.close()?;
        Ok(())
    }
}
