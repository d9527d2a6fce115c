//! 完整性校验
//!
//! 分块流式计算 MD5，资源包可达数 GB，不能一次性读入内存

use md5::Context as Md5Context;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::EngineError;

/// 读缓冲区大小
const READ_BUFFER_SIZE: usize = 1024 * 1024;
/// 单次读取块大小
const BLOCK_SIZE: usize = 64 * 1024;

/// MD5 校验器
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// 计算文件 MD5（小写十六进制）
    ///
    /// 在阻塞线程池中执行文件 I/O
    pub async fn compute(path: &Path) -> io::Result<String> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::compute_sync(&path))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("计算 MD5 任务执行失败: {}", e)))?
    }

    /// 同步计算文件 MD5
    pub fn compute_sync(path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let mut hasher = Md5Context::new();
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.consume(&buffer[..n]);
            total += n as u64;
        }

        let digest = format!("{:x}", hasher.compute());
        debug!("MD5 计算完成: path={:?}, size={}, md5={}", path, total, digest);
        Ok(digest)
    }

    /// 校验文件 MD5 与期望值（忽略大小写）
    pub async fn verify(path: &Path, expected: &str) -> Result<(), EngineError> {
        let actual = Self::compute(path).await?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            info!("✓ MD5 校验通过: {:?}", path);
            Ok(())
        } else {
            Err(EngineError::ChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compute_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = ChecksumVerifier::compute(&path).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_verify_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.bin");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(ChecksumVerifier::verify(&path, "5EB63BBBE01EEED093CB22BB8F5ACDC3")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let mut data = vec![7u8; 3 * BLOCK_SIZE + 17];
        std::fs::write(&path, &data).unwrap();
        let good = format!("{:x}", md5::compute(&data));
        assert!(ChecksumVerifier::verify(&path, &good).await.is_ok());

        data[BLOCK_SIZE + 1] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        let err = ChecksumVerifier::verify(&path, &good).await.unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = ChecksumVerifier::verify(Path::new("/nonexistent/file"), "0")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
