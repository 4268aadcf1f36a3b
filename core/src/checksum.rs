use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

impl ChecksumRequest {
    pub fn new(checksum_type: ChecksumType, expected_hex: impl Into<String>) -> Self {
        Self {
            checksum_type,
            expected_hex: expected_hex.into(),
        }
    }
}

/// Fails with `Validation` when the file digest differs from the expected one.
pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> CoreResult<()> {
    let actual = file_digest(path, req.checksum_type)?;
    if actual.eq_ignore_ascii_case(req.expected_hex.trim()) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "{} mismatch for {}: expected {}, got {}",
            req.checksum_type.as_str(),
            path.display(),
            req.expected_hex,
            actual
        )))
    }
}

pub fn file_digest(path: &Path, checksum_type: ChecksumType) -> CoreResult<String> {
    match checksum_type {
        ChecksumType::Md5 => digest_file::<Md5>(path),
        ChecksumType::Sha1 => digest_file::<Sha1>(path),
        ChecksumType::Sha256 => digest_file::<Sha256>(path),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn digest_file<D: Digest>(path: &Path) -> CoreResult<String> {
    let file = File::open(path).map_err(|err| CoreError::Disk(err.to_string()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| CoreError::Disk(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn verifies_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        fs::write(&path, b"abc").unwrap();

        let sha = ChecksumRequest::new(
            ChecksumType::Sha256,
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
        );
        assert!(verify_checksum(&path, &sha).is_ok());

        let md5 = ChecksumRequest::new(ChecksumType::Md5, "900150983cd24fb0d6963f7d28e17f72");
        assert!(verify_checksum(&path, &md5).is_ok());

        let wrong = ChecksumRequest::new(ChecksumType::Sha1, "00");
        assert!(matches!(
            verify_checksum(&path, &wrong),
            Err(CoreError::Validation(_))
        ));
    }
}
