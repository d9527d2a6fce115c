//! 资源包解压
//!
//! 下载并校验完成的压缩包解压到安装目录。
//! 解压失败时保留压缩包，之后可以直接重新解压而无需重新下载。

use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::ExtractError;

/// 解压器（外部协作方接口）
pub trait ArchiveExtractor: Send + Sync {
    /// 把 `archive` 解压到 `dest_dir`
    ///
    /// 同步执行，调用方负责放到阻塞线程池
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), ExtractError>;
}

/// ZIP 解压器
#[derive(Debug, Clone)]
pub struct ZipExtractor {
    /// 解压成功后删除压缩包以释放空间
    remove_archive: bool,
}

impl ZipExtractor {
    pub fn new(remove_archive: bool) -> Self {
        Self { remove_archive }
    }
}

impl Default for ZipExtractor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive_path: &Path, dest_dir: &Path) -> Result<(), ExtractError> {
        if !archive_path.exists() {
            return Err(ExtractError::NotFound(archive_path.to_path_buf()));
        }

        let file = File::open(archive_path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut extracted = 0usize;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            // 路径逃逸出安装目录的条目直接跳过
            let out_path = match entry.enclosed_name() {
                Some(p) => dest_dir.join(p),
                None => {
                    warn!("跳过不安全的压缩包条目: {}", entry.name());
                    continue;
                }
            };

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
            } else {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out_file = File::create(&out_path)?;
                io::copy(&mut entry, &mut out_file)?;
                extracted += 1;
            }
        }

        info!(
            "✓ 解压完成: {:?} -> {:?} ({} 个文件)",
            archive_path, dest_dir, extracted
        );

        if self.remove_archive {
            fs::remove_file(archive_path)?;
            debug!("已删除压缩包: {:?}", archive_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_and_remove_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(
            &archive,
            &[("data/a.txt", b"alpha"), ("b.txt", b"beta"), ("../escape.txt", b"x")],
        );

        let dest = dir.path().join("game");
        ZipExtractor::new(true).extract(&archive, &dest).unwrap();

        assert_eq!(fs::read(dest.join("data/a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dest.join("b.txt")).unwrap(), b"beta");
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_keep_archive_when_configured() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.zip");
        write_zip(&archive, &[("a.txt", b"alpha")]);

        ZipExtractor::new(false)
            .extract(&archive, &dir.path().join("game"))
            .unwrap();
        assert!(archive.exists());
    }

    #[test]
    fn test_corrupt_archive_is_preserved() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pack.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let err = ZipExtractor::new(true)
            .extract(&archive, dir.path())
            .unwrap_err();
        assert!(matches!(err, ExtractError::Zip(_)));
        assert!(archive.exists());
    }

    #[test]
    fn test_missing_archive() {
        let dir = TempDir::new().unwrap();
        let err = ZipExtractor::default()
            .extract(&dir.path().join("missing.zip"), dir.path())
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotFound(_)));
    }
}
