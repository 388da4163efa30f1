//! Publisher Identity
//!
//! Zip-based artifacts carry an embedded ed25519 signature at
//! `META-INF/UPDRAFT.SIG`. The signature covers a SHA-256 digest of every
//! other file entry (name, NUL, little-endian length, content) in archive
//! order. The signer fingerprint is the SHA-256 of the raw public key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::engine::error::IdentityError;
use crate::engine::updater::capabilities::SignerInspector;

pub const SIGNATURE_ENTRY: &str = "META-INF/UPDRAFT.SIG";
const ALGORITHM: &str = "ed25519";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignatureBlock {
    algorithm: String,
    public_key: String,
    signature: String,
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Lowercase hex SHA-256 of the raw public key
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub fn encode_signing_key(key: &SigningKey) -> String {
    BASE64.encode(key.to_bytes())
}

pub fn decode_signing_key(encoded: &str) -> Result<SigningKey, IdentityError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| IdentityError::Malformed(format!("signing key: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IdentityError::Malformed("signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn save_signing_key(path: &Path, key: &SigningKey) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encode_signing_key(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn load_signing_key(path: &Path) -> Result<SigningKey, IdentityError> {
    decode_signing_key(&fs::read_to_string(path)?)
}

fn not_an_archive(e: zip::result::ZipError) -> IdentityError {
    IdentityError::NotAnArchive(e.to_string())
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, IdentityError> {
    let file = File::open(path)?;
    ZipArchive::new(BufReader::new(file)).map_err(not_an_archive)
}

/// Digest of every signed entry, in archive order
fn content_digest<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<[u8; 32], IdentityError> {
    let mut hasher = Sha256::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(not_an_archive)?;
        if entry.is_dir() || entry.name() == SIGNATURE_ENTRY {
            continue;
        }
        hasher.update(entry.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.size().to_le_bytes());
        io::copy(&mut entry, &mut hasher)?;
    }
    Ok(hasher.finalize().into())
}

fn read_signature_block<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<SignatureBlock, IdentityError> {
    let mut entry = match archive.by_name(SIGNATURE_ENTRY) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(IdentityError::MissingSignature),
        Err(e) => return Err(not_an_archive(e)),
    };
    let mut raw = String::new();
    entry.read_to_string(&mut raw)?;
    serde_json::from_str(&raw).map_err(|e| IdentityError::Malformed(e.to_string()))
}

/// Verify the embedded signature and return the signer's fingerprint.
pub fn verify_artifact(path: &Path) -> Result<String, IdentityError> {
    let mut archive = open_archive(path)?;
    let block = read_signature_block(&mut archive)?;
    if block.algorithm != ALGORITHM {
        return Err(IdentityError::Malformed(format!(
            "unsupported algorithm {}",
            block.algorithm
        )));
    }

    let key_bytes: [u8; 32] = BASE64
        .decode(&block.public_key)
        .map_err(|e| IdentityError::Malformed(format!("public key: {e}")))?
        .try_into()
        .map_err(|_| IdentityError::Malformed("public key must be 32 bytes".to_string()))?;
    let public_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| IdentityError::Malformed(format!("public key: {e}")))?;

    let sig_bytes: [u8; 64] = BASE64
        .decode(&block.signature)
        .map_err(|e| IdentityError::Malformed(format!("signature: {e}")))?
        .try_into()
        .map_err(|_| IdentityError::Malformed("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let digest = content_digest(&mut archive)?;
    public_key
        .verify(&digest, &signature)
        .map_err(|_| IdentityError::BadSignature)?;

    Ok(fingerprint(&public_key))
}

/// Copy `input` to `output` with a fresh signature entry. Any existing
/// signature is replaced. Returns the signer fingerprint.
pub fn sign_artifact(input: &Path, output: &Path, key: &SigningKey) -> Result<String, IdentityError> {
    let mut source = open_archive(input)?;
    let digest = content_digest(&mut source)?;
    let signature = key.sign(&digest);
    let block = SignatureBlock {
        algorithm: ALGORITHM.to_string(),
        public_key: BASE64.encode(key.verifying_key().as_bytes()),
        signature: BASE64.encode(signature.to_bytes()),
    };

    let staging = staging_path(output);
    let mut writer = ZipWriter::new(File::create(&staging)?);
    for index in 0..source.len() {
        let entry = source.by_index_raw(index).map_err(not_an_archive)?;
        if entry.name() == SIGNATURE_ENTRY {
            continue;
        }
        writer.raw_copy_file(entry).map_err(not_an_archive)?;
    }
    writer
        .start_file(SIGNATURE_ENTRY, SimpleFileOptions::default())
        .map_err(not_an_archive)?;
    serde_json::to_writer_pretty(&mut writer, &block)
        .map_err(|e| IdentityError::Malformed(e.to_string()))?;
    writer.finish().map_err(not_an_archive)?;
    drop(source);

    fs::rename(&staging, output)?;
    let signer = fingerprint(&key.verifying_key());
    tracing::info!(artifact = %output.display(), fingerprint = %signer, "Artifact signed");
    Ok(signer)
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".signing");
    PathBuf::from(name)
}

/// Signer inspection for zip-based artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipSignerInspector;

impl SignerInspector for ZipSignerInspector {
    fn signer_fingerprint(&self, artifact: &Path) -> Result<String, IdentityError> {
        verify_artifact(artifact)
    }
}
