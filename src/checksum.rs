use crate::error::DownloadError;
use digest::Digest;
use log::debug;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

const BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[default]
    MD5,
    SHA1,
    SHA256,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChecksumAlgorithm::MD5 => "MD5",
            ChecksumAlgorithm::SHA1 => "SHA1",
            ChecksumAlgorithm::SHA256 => "SHA256",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "MD5" => Ok(ChecksumAlgorithm::MD5),
            "SHA1" => Ok(ChecksumAlgorithm::SHA1),
            "SHA256" => Ok(ChecksumAlgorithm::SHA256),
            other => Err(format!("unsupported checksum algorithm: {}", other)),
        }
    }
}

/// Result of checking a finished file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    SizeMismatch { expected: u64, actual: u64 },
    DigestMismatch { expected: String, actual: String },
}

impl Verdict {
    /// Converts a failed verdict into the matching job error.
    pub fn into_result(self, algorithm: ChecksumAlgorithm) -> Result<(), DownloadError> {
        match self {
            Verdict::Match => Ok(()),
            Verdict::SizeMismatch { expected, actual } => {
                Err(DownloadError::SizeMismatch { expected, actual })
            }
            Verdict::DigestMismatch { expected, actual } => Err(DownloadError::ChecksumMismatch {
                algorithm: algorithm.to_string(),
                expected,
                actual,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChecksumVerifier {
    pub algorithm: ChecksumAlgorithm,
}

impl ChecksumVerifier {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Checks the file length first, then streams it through the digest.
    ///
    /// Blocking; callers on the async runtime go through `spawn_blocking`.
    pub fn verify(
        &self,
        file_path: &Path,
        expected_size: u64,
        expected_digest: &str,
    ) -> Result<Verdict, DownloadError> {
        let actual_size = std::fs::metadata(file_path)?.len();
        if actual_size != expected_size {
            debug!(
                "[Checksum] {:?}: size {} != expected {}, skipping digest",
                file_path, actual_size, expected_size
            );
            return Ok(Verdict::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        let actual = self.digest_file(file_path)?;
        let expected = expected_digest.trim().to_ascii_lowercase();
        debug!(
            "[Checksum] {:?} {}: expected={} actual={}",
            file_path, self.algorithm, expected, actual
        );

        if actual == expected {
            Ok(Verdict::Match)
        } else {
            Ok(Verdict::DigestMismatch { expected, actual })
        }
    }

    /// Lower-case hex digest of the whole file.
    pub fn digest_file(&self, file_path: &Path) -> Result<String, DownloadError> {
        match self.algorithm {
            ChecksumAlgorithm::MD5 => hash_file::<Md5>(file_path),
            ChecksumAlgorithm::SHA1 => hash_file::<Sha1>(file_path),
            ChecksumAlgorithm::SHA256 => hash_file::<Sha256>(file_path),
        }
    }
}

fn hash_file<D: Digest>(file_path: &Path) -> Result<String, DownloadError> {
    let file = File::open(file_path)?;
    let mut reader = BufReader::with_capacity(BLOCK_SIZE, file);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
