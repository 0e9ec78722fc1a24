//! Fernet-based file encryption for the backup/restore pipeline.
//!
//! The key is derived the same way the original does it: SHA-256 the
//! operator-supplied secret, then urlsafe-base64 encode the digest into a
//! valid Fernet key. Using the real `fernet` crate keeps the on-disk format
//! compatible with anything produced by Python's `cryptography.fernet`.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use fernet::Fernet;
use sha2::{Digest, Sha256};

use crate::error::{BackupError, Result};

fn derive_fernet_key(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    URL_SAFE.encode(digest)
}

fn fernet_for(secret: &str) -> Result<Fernet> {
    let key = derive_fernet_key(secret);
    Fernet::new(&key).ok_or_else(|| BackupError::input("Failed to derive a valid Fernet key"))
}

pub fn encrypt_file(input_path: &Path, secret: &str, output_path: Option<&Path>) -> Result<PathBuf> {
    if !input_path.exists() {
        return Err(BackupError::input(format!(
            "Input file not found for encryption: {}",
            input_path.display()
        )));
    }

    let target = match output_path {
        Some(p) => p.to_path_buf(),
        None => with_appended_extension(input_path, "enc"),
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let fernet = fernet_for(secret)?;
    let data = fs::read(input_path)?;
    let encrypted = fernet.encrypt(&data);
    fs::write(&target, encrypted.as_bytes())?;

    Ok(target)
}

pub fn decrypt_file(input_path: &Path, secret: &str, output_path: Option<&Path>) -> Result<PathBuf> {
    if !input_path.exists() {
        return Err(BackupError::input(format!(
            "Input file not found for decryption: {}",
            input_path.display()
        )));
    }

    let target = match output_path {
        Some(p) => p.to_path_buf(),
        None => {
            if input_path.extension().and_then(|e| e.to_str()) != Some("enc") {
                return Err(BackupError::input(
                    "Auto output path for decryption requires a .enc file.",
                ));
            }
            input_path.with_extension("")
        }
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let fernet = fernet_for(secret)?;
    let token = fs::read_to_string(input_path)?;
    let decrypted = fernet
        .decrypt(token.trim())
        .map_err(|_| BackupError::input("Failed to decrypt file: invalid token or wrong secret"))?;
    fs::write(&target, decrypted)?;

    Ok(target)
}

fn with_appended_extension(path: &Path, extra: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extra);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn round_trips_through_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dump.sql.gz");
        std::fs::File::create(&input).unwrap().write_all(b"gzip bytes go here").unwrap();

        let encrypted = encrypt_file(&input, "super-secret", None).unwrap();
        assert!(encrypted.to_string_lossy().ends_with(".gz.enc"));

        let decrypted = decrypt_file(&encrypted, "super-secret", None).unwrap();
        assert_eq!(std::fs::read(&input).unwrap(), std::fs::read(&decrypted).unwrap());
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dump.sql.gz");
        std::fs::File::create(&input).unwrap().write_all(b"gzip bytes go here").unwrap();

        let encrypted = encrypt_file(&input, "right-secret", None).unwrap();
        let err = decrypt_file(&encrypted, "wrong-secret", None).unwrap_err();
        assert!(err.to_string().contains("Failed to decrypt"));
    }
}
