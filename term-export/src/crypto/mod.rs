//! Multi-recipient encryption of exported files.
//!
//! - [`keys`]: recipient public and secret key files
//! - [`keyring`]: run-scoped key import
//! - [`envelope`]: the streaming cipher format
//! - [`armor`]: optional ASCII armor

pub mod armor;
pub mod envelope;
pub mod keyring;
pub mod keys;

pub use envelope::{Decryptor, MultiRecipientEncryptor};
pub use keyring::Keyring;
pub use keys::{RecipientKey, RecipientSecret};
