use crate::errors::ErrorKind;
use crate::utils::to_hex;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

pub const CHECKSUM_PREFIX: &str = "sha256:";
const CHUNK: usize = 8 * 1024;

/// Stream a file through SHA-256. Memory stays bounded by the 8 KiB chunk
/// buffer regardless of file size.
pub async fn compute_checksum(path: &Path) -> Result<String, ErrorKind> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::IoError(e.into()),
        })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| ErrorKind::IoError(e.into()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format_checksum(&hasher.finalize()))
}

pub fn checksum_of_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format_checksum(&hasher.finalize())
}

fn format_checksum(digest: &[u8]) -> String {
    format!("{CHECKSUM_PREFIX}{}", to_hex(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_vectors() {
        assert_eq!(
            checksum_of_bytes(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            checksum_of_bytes(b"hello world"),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn file_checksum_matches_bytes_and_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&payload)
            .unwrap();
        let first = compute_checksum(&path).await.unwrap();
        let second = compute_checksum(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, checksum_of_bytes(&payload));
        assert!(first.starts_with(CHECKSUM_PREFIX));
        assert_eq!(first.len(), CHECKSUM_PREFIX.len() + 64);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = compute_checksum(Path::new("/no/such/file")).await.unwrap_err();
        assert!(matches!(err, ErrorKind::NotFound));
    }
}
