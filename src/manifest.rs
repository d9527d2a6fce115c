//! 游戏清单
//!
//! 清单由外部获取（版本检查接口），引擎只消费、不修改

use crate::error::EngineError;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 单个资源包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    /// 带签名的下载地址
    pub url: String,
    /// 32 位十六进制 MD5
    pub md5: String,
    /// 声明大小（字节）
    pub size: u64,
    /// 保存文件名（相对安装目录）
    pub filename: String,
}

impl Pack {
    /// 使用 URL 推导文件名创建资源包
    pub fn new(url: impl Into<String>, md5: impl Into<String>, size: u64) -> Self {
        let url = url.into();
        let filename = Self::filename_from_url(&url);
        Self {
            url,
            md5: md5.into(),
            size,
            filename,
        }
    }

    /// 取 URL 路径的最后一段作为文件名，去掉查询参数（CDN 签名）
    pub fn filename_from_url(url: &str) -> String {
        if let Ok(parsed) = Url::parse(url) {
            if let Some(name) = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
            {
                return name.to_string();
            }
        }

        let raw = url.split(['?', '#']).next().unwrap_or(url);
        raw.rsplit('/').next().unwrap_or(raw).to_string()
    }

    /// 校验条目合法性
    pub fn validate(&self) -> Result<(), EngineError> {
        let name = self.filename.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(EngineError::invalid_entry(name, "文件名非法"));
        }
        if self.size == 0 {
            return Err(EngineError::invalid_entry(name, "声明大小必须大于 0"));
        }
        if self.md5.len() != 32 || !self.md5.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::invalid_entry(
                name,
                format!("MD5 格式错误: {}", self.md5),
            ));
        }
        match Url::parse(&self.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(EngineError::invalid_entry(
                name,
                format!("不支持的协议: {}", url.scheme()),
            )),
            Err(e) => Err(EngineError::invalid_entry(name, format!("URL 无法解析: {}", e))),
        }
    }
}

/// 游戏清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub game_id: String,
    pub version: String,
    pub packs: Vec<Pack>,
    #[serde(default)]
    pub total_size: u64,
    /// 游戏文件整体摘要
    #[serde(default)]
    pub game_files_md5: String,
    /// 单文件校验清单地址
    #[serde(default)]
    pub file_path: String,
}

impl Manifest {
    /// 校验所有资源包，任何一个不合法都拒绝整个清单
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.packs.is_empty() {
            return Err(EngineError::invalid_entry(
                &self.game_id,
                "清单中没有任何资源包",
            ));
        }

        let mut seen = HashSet::new();
        for pack in &self.packs {
            pack.validate()?;
            if !seen.insert(pack.filename.as_str()) {
                return Err(EngineError::invalid_entry(&pack.filename, "文件名重复"));
            }
        }
        Ok(())
    }

    /// 所有资源包声明大小之和
    pub fn packs_size(&self) -> u64 {
        self.packs.iter().map(|p| p.size).sum()
    }
}

/// 清单来源（外部协作方）
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, game_id: &str) -> Result<Manifest, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(name: &str) -> Pack {
        Pack {
            url: format!("https://cdn.example.com/pkg/{}?auth_key=abc", name),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 1024,
            filename: name.to_string(),
        }
    }

    #[test]
    fn test_filename_from_url_strips_query() {
        assert_eq!(
            Pack::filename_from_url("https://cdn.example.com/a/b/game_2.0.1.zip.001?auth_key=1-0-x"),
            "game_2.0.1.zip.001"
        );
        assert_eq!(Pack::filename_from_url("not a url/pack.zip?x=1"), "pack.zip");
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = Manifest {
            game_id: "1".to_string(),
            version: "2.0.1".to_string(),
            packs: vec![pack("a.zip"), pack("b.zip")],
            total_size: 2048,
            game_files_md5: String::new(),
            file_path: String::new(),
        };
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.packs_size(), 2048);
    }

    #[test]
    fn test_invalid_entries() {
        let mut p = pack("a.zip");
        p.size = 0;
        assert!(matches!(
            p.validate(),
            Err(EngineError::InvalidManifestEntry { .. })
        ));

        let mut p = pack("a.zip");
        p.md5 = "xyz".to_string();
        assert!(p.validate().is_err());

        let mut p = pack("a.zip");
        p.filename = "../evil.zip".to_string();
        assert!(p.validate().is_err());

        let mut p = pack("a.zip");
        p.url = "ftp://cdn.example.com/a.zip".to_string();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_uppercase_md5_accepted() {
        let mut p = pack("a.zip");
        p.md5 = p.md5.to_uppercase();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_duplicate_filenames_rejected() {
        let manifest = Manifest {
            game_id: "1".to_string(),
            version: "2.0.1".to_string(),
            packs: vec![pack("a.zip"), pack("a.zip")],
            total_size: 0,
            game_files_md5: String::new(),
            file_path: String::new(),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let json = r#"{
            "gameId": "1",
            "version": "2.0.1",
            "packs": [{"url": "https://x/a.zip", "md5": "d41d8cd98f00b204e9800998ecf8427e", "size": 10, "filename": "a.zip"}]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.packs[0].filename, "a.zip");
        assert_eq!(manifest.total_size, 0);
    }
}
