//! Multi-recipient streaming encryption.
//!
//! One ciphertext is addressed to every recipient at once. A random 256-bit
//! content key encrypts the body; the header carries one stanza per recipient
//! with that content key wrapped for the recipient's X25519 key. Any single
//! recipient can unwrap it.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic        "TXENC" 0x01
//! count        u16
//! stanza*count key digest [32] | ephemeral public key [32] | wrapped key [48]
//! nonce prefix [7]
//! frame*       flag u8 (1 = final) | length u32 | AES-256-GCM ciphertext
//! ```
//!
//! The wrap key is HKDF-SHA256 over the X25519 shared secret, salted with the
//! ephemeral and recipient public keys. Body frames hold up to 64 KiB of
//! plaintext; the nonce of frame `i` is `prefix | i | flag`, so frames cannot
//! be reordered, dropped, or truncated without detection.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, instrument};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::armor::{dearmor, is_armored, ArmorWriter};
use super::keys::{key_digest, random_key, RecipientKey, RecipientSecret, KEY_LEN};
use crate::error::{ExportError, Result};

pub const MAGIC: &[u8; 6] = b"TXENC\x01";

const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const WRAPPED_LEN: usize = KEY_LEN + TAG_LEN;
const NONCE_PREFIX_LEN: usize = 7;
const WRAP_INFO: &[u8] = b"term-export x25519 content key wrap v1";
const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

fn encryption_error(context: &str) -> impl Fn(aes_gcm::Error) -> ExportError + '_ {
    move |_| ExportError::Encryption(format!("{context} failed"))
}

fn wrap_key(
    shared: &[u8; 32],
    ephemeral: &[u8; KEY_LEN],
    recipient: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 2 * KEY_LEN];
    salt[..KEY_LEN].copy_from_slice(ephemeral);
    salt[KEY_LEN..].copy_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, okm.as_mut_slice())
        .map_err(|e| ExportError::Encryption(format!("key derivation failed: {e}")))?;
    Ok(okm)
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, flag: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = flag;
    nonce
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    if read_full(reader, buf)? != buf.len() {
        return Err(ExportError::Encryption(format!(
            "ciphertext truncated while reading {what}"
        )));
    }
    Ok(())
}

/// Encrypts plaintext for a set of recipients.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiRecipientEncryptor {
    armor: bool,
}

impl MultiRecipientEncryptor {
    /// Binary output.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_armor(mut self, armor: bool) -> Self {
        self.armor = armor;
        self
    }

    /// Encrypts `reader` into `writer`, returning the plaintext byte count.
    ///
    /// # Errors
    ///
    /// [`ExportError::Encryption`] when there are no recipients, a recipient
    /// key is degenerate, or the cipher fails.
    pub fn encrypt<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        recipients: &[RecipientKey],
    ) -> Result<u64> {
        if self.armor {
            let mut armored = ArmorWriter::new(writer)?;
            let bytes = write_envelope(reader, &mut armored, recipients)?;
            armored.finish()?;
            Ok(bytes)
        } else {
            let mut writer = writer;
            let bytes = write_envelope(reader, &mut writer, recipients)?;
            writer.flush()?;
            Ok(bytes)
        }
    }

    /// Encrypts a file on a blocking worker thread.
    #[instrument(skip(self, recipients), fields(recipients = recipients.len()))]
    pub async fn encrypt_file(
        &self,
        input: &Path,
        output: &Path,
        recipients: &[RecipientKey],
    ) -> Result<u64> {
        let encryptor = *self;
        let input: PathBuf = input.to_path_buf();
        let output: PathBuf = output.to_path_buf();
        let recipients = recipients.to_vec();
        let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
            let reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            encryptor.encrypt(reader, writer, &recipients)
        })
        .await
        .map_err(|e| ExportError::Encryption(format!("encryption task failed: {e}")))??;
        debug!(bytes, "Encrypted file");
        Ok(bytes)
    }
}

fn write_envelope<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    recipients: &[RecipientKey],
) -> Result<u64> {
    if recipients.is_empty() {
        return Err(ExportError::Encryption(
            "at least one recipient is required".to_string(),
        ));
    }
    let count = u16::try_from(recipients.len())
        .map_err(|_| ExportError::Encryption("too many recipients".to_string()))?;

    let content_key = random_key();
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut prefix);

    let mut header = Vec::with_capacity(
        MAGIC.len() + 2 + recipients.len() * (32 + KEY_LEN + WRAPPED_LEN) + NONCE_PREFIX_LEN,
    );
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&count.to_be_bytes());

    for recipient in recipients {
        let ephemeral = StaticSecret::from(*random_key());
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient.public_key()));
        if !shared.was_contributory() {
            return Err(ExportError::Encryption(format!(
                "recipient key {} is not a valid X25519 key",
                recipient.fingerprint_id()
            )));
        }
        let kek = wrap_key(shared.as_bytes(), &ephemeral_public, recipient.public_key())?;
        let wrapped = Aes256Gcm::new_from_slice(kek.as_slice())
            .map_err(|e| ExportError::Encryption(format!("invalid wrap key: {e}")))?
            .encrypt(Nonce::from_slice(&[0u8; 12]), content_key.as_slice())
            .map_err(encryption_error("key wrap"))?;

        header.extend_from_slice(&key_digest(recipient.public_key()));
        header.extend_from_slice(&ephemeral_public);
        header.extend_from_slice(&wrapped);
    }
    header.extend_from_slice(&prefix);
    writer.write_all(&header)?;

    let cipher = Aes256Gcm::new_from_slice(content_key.as_slice())
        .map_err(|e| ExportError::Encryption(format!("invalid content key: {e}")))?;

    let mut current = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut next = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;
    let mut total: u64 = 0;

    loop {
        // A short read means end of input; otherwise look ahead one chunk
        let next_len = if current_len < CHUNK_SIZE {
            0
        } else {
            read_full(&mut reader, &mut next)?
        };
        let flag = if next_len == 0 { FLAG_FINAL } else { FLAG_MORE };

        let nonce = frame_nonce(&prefix, counter, flag);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), &current[..current_len])
            .map_err(encryption_error("body encryption"))?;
        let sealed_len = u32::try_from(sealed.len())
            .map_err(|_| ExportError::Encryption("frame too large".to_string()))?;
        writer.write_all(&[flag])?;
        writer.write_all(&sealed_len.to_be_bytes())?;
        writer.write_all(&sealed)?;
        total += current_len as u64;

        if flag == FLAG_FINAL {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        counter = counter
            .checked_add(1)
            .ok_or_else(|| ExportError::Encryption("too many frames".to_string()))?;
    }

    Ok(total)
}

/// Decrypts ciphertexts produced by [`MultiRecipientEncryptor`].
pub struct Decryptor;

impl Decryptor {
    /// Decrypts `reader` into `writer` with one recipient's secret key,
    /// returning the plaintext byte count. Armored input is detected.
    pub fn decrypt<R: Read, W: Write>(
        reader: R,
        mut writer: W,
        secret: &RecipientSecret,
    ) -> Result<u64> {
        let mut reader = BufReader::new(reader);
        let armored = is_armored(reader.fill_buf()?);
        let bytes = if armored {
            let mut text = String::new();
            reader.read_to_string(&mut text)?;
            let binary = dearmor(&text)?;
            read_envelope(binary.as_slice(), &mut writer, secret)?
        } else {
            read_envelope(reader, &mut writer, secret)?
        };
        writer.flush()?;
        Ok(bytes)
    }

    /// Decrypts a file on a blocking worker thread.
    pub async fn decrypt_file(input: &Path, output: &Path, secret: &RecipientSecret) -> Result<u64> {
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let secret = secret.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let reader = File::open(&input)?;
            let writer = BufWriter::new(File::create(&output)?);
            Self::decrypt(reader, writer, &secret)
        })
        .await
        .map_err(|e| ExportError::Encryption(format!("decryption task failed: {e}")))?
    }
}

fn read_envelope<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    secret: &RecipientSecret,
) -> Result<u64> {
    let mut magic = [0u8; 6];
    read_exact(&mut reader, &mut magic, "magic")?;
    if &magic != MAGIC {
        return Err(ExportError::Encryption(
            "not a term-export ciphertext".to_string(),
        ));
    }

    let mut count = [0u8; 2];
    read_exact(&mut reader, &mut count, "recipient count")?;
    let count = u16::from_be_bytes(count);

    let own = secret.recipient()?;
    let own_digest = key_digest(own.public_key());
    let mut content_key: Option<Zeroizing<Vec<u8>>> = None;

    for _ in 0..count {
        let mut digest = [0u8; 32];
        let mut ephemeral = [0u8; KEY_LEN];
        let mut wrapped = [0u8; WRAPPED_LEN];
        read_exact(&mut reader, &mut digest, "recipient stanza")?;
        read_exact(&mut reader, &mut ephemeral, "recipient stanza")?;
        read_exact(&mut reader, &mut wrapped, "recipient stanza")?;

        if content_key.is_some() || digest != own_digest {
            continue;
        }
        let shared = secret.diffie_hellman(&PublicKey::from(ephemeral));
        let kek = wrap_key(shared.as_bytes(), &ephemeral, own.public_key())?;
        let key = Aes256Gcm::new_from_slice(kek.as_slice())
            .map_err(|e| ExportError::Encryption(format!("invalid wrap key: {e}")))?
            .decrypt(Nonce::from_slice(&[0u8; 12]), wrapped.as_slice())
            .map_err(encryption_error("key unwrap"))?;
        content_key = Some(Zeroizing::new(key));
    }

    let content_key = content_key.ok_or_else(|| {
        ExportError::Encryption(format!(
            "ciphertext is not addressed to key {}",
            own.fingerprint_id()
        ))
    })?;

    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    read_exact(&mut reader, &mut prefix, "nonce prefix")?;

    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|e| ExportError::Encryption(format!("invalid content key: {e}")))?;

    let mut counter: u32 = 0;
    let mut total: u64 = 0;
    let mut sealed = vec![0u8; CHUNK_SIZE + TAG_LEN];
    loop {
        let mut flag = [0u8; 1];
        read_exact(&mut reader, &mut flag, "frame header")?;
        let flag = flag[0];
        if flag != FLAG_MORE && flag != FLAG_FINAL {
            return Err(ExportError::Encryption(format!("invalid frame flag {flag}")));
        }
        let mut len = [0u8; 4];
        read_exact(&mut reader, &mut len, "frame header")?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(ExportError::Encryption(format!("invalid frame length {len}")));
        }
        read_exact(&mut reader, &mut sealed[..len], "frame body")?;

        let nonce = frame_nonce(&prefix, counter, flag);
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), &sealed[..len])
                .map_err(encryption_error("body decryption"))?,
        );
        writer.write_all(&plain)?;
        total += plain.len() as u64;

        if flag == FLAG_FINAL {
            let mut trailing = [0u8; 1];
            if read_full(&mut reader, &mut trailing)? != 0 {
                return Err(ExportError::Encryption(
                    "unexpected data after final frame".to_string(),
                ));
            }
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| ExportError::Encryption("too many frames".to_string()))?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(email: &str) -> (RecipientSecret, RecipientKey) {
        let secret = RecipientSecret::generate(vec![email.to_string()]);
        let public = secret.recipient().unwrap();
        (secret, public)
    }

    fn round_trip(plaintext: &[u8], armor: bool) {
        let (alice, alice_pub) = pair("alice@example.com");
        let (bob, bob_pub) = pair("bob@example.com");
        let recipients = [alice_pub, bob_pub];

        let mut ciphertext = Vec::new();
        let written = MultiRecipientEncryptor::new()
            .with_armor(armor)
            .encrypt(plaintext, &mut ciphertext, &recipients)
            .unwrap();
        assert_eq!(written, plaintext.len() as u64);

        for secret in [&alice, &bob] {
            let mut decrypted = Vec::new();
            Decryptor::decrypt(ciphertext.as_slice(), &mut decrypted, secret).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_round_trip_sizes() {
        round_trip(b"", false);
        round_trip(b"id,name\n1,alice\n", false);
        round_trip(&vec![7u8; CHUNK_SIZE], false);
        round_trip(&vec![9u8; 2 * CHUNK_SIZE + 17], false);
    }

    #[test]
    fn test_round_trip_armored() {
        round_trip(b"hello armored world", true);
        round_trip(&vec![1u8; CHUNK_SIZE + 1], true);
    }

    #[test]
    fn test_single_ciphertext_for_all_recipients() {
        let (_, a) = pair("a@example.com");
        let (_, b) = pair("b@example.com");
        let mut ciphertext = Vec::new();
        MultiRecipientEncryptor::new()
            .encrypt(&b"x"[..], &mut ciphertext, &[a, b])
            .unwrap();
        assert!(ciphertext.starts_with(MAGIC));
        assert_eq!(u16::from_be_bytes([ciphertext[6], ciphertext[7]]), 2);
    }

    #[test]
    fn test_non_recipient_cannot_decrypt() {
        let (_, alice_pub) = pair("alice@example.com");
        let (mallory, _) = pair("mallory@example.com");
        let mut ciphertext = Vec::new();
        MultiRecipientEncryptor::new()
            .encrypt(&b"secret"[..], &mut ciphertext, &[alice_pub])
            .unwrap();
        let err = Decryptor::decrypt(ciphertext.as_slice(), Vec::new(), &mallory).unwrap_err();
        assert_eq!(err.kind(), "EncryptionError");
    }

    #[test]
    fn test_tampering_and_truncation_are_detected() {
        let (alice, alice_pub) = pair("alice@example.com");
        let plaintext = vec![3u8; CHUNK_SIZE + 100];
        let mut ciphertext = Vec::new();
        MultiRecipientEncryptor::new()
            .encrypt(plaintext.as_slice(), &mut ciphertext, &[alice_pub])
            .unwrap();

        let mut flipped = ciphertext.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(Decryptor::decrypt(flipped.as_slice(), Vec::new(), &alice).is_err());

        let truncated = &ciphertext[..ciphertext.len() - 120];
        assert!(Decryptor::decrypt(truncated, Vec::new(), &alice).is_err());

        let mut extended = ciphertext.clone();
        extended.push(0);
        assert!(Decryptor::decrypt(extended.as_slice(), Vec::new(), &alice).is_err());
    }

    #[test]
    fn test_no_recipients_is_rejected() {
        let err = MultiRecipientEncryptor::new()
            .encrypt(&b"x"[..], Vec::new(), &[])
            .unwrap_err();
        assert_eq!(err.kind(), "EncryptionError");
    }
}
