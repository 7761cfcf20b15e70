use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;

pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Case-insensitive comparison of hex digests.
pub fn verify(expected: &str, computed: &str) -> Result<(), DownloadError> {
    if expected.trim().eq_ignore_ascii_case(computed) {
        Ok(())
    } else {
        Err(DownloadError::HashMismatch {
            expected: expected.trim().to_string(),
            computed: computed.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn hashes_file_contents() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"abc").unwrap();
        assert_eq!(
            calculate_hash(file.path()).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn verify_ignores_case() {
        let digest = sha256_bytes(b"abc");
        assert!(verify(&digest.to_uppercase(), &digest).is_ok());
        assert!(matches!(
            verify("00", &digest),
            Err(DownloadError::HashMismatch { .. })
        ));
    }
}
