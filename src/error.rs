//! 错误类型定义
//!
//! - `TransferError`: 单个分段传输的错误（可重试 / 不可重试）
//! - `ExtractError`: 解压阶段的错误
//! - `EngineError`: 引擎对外暴露的统一错误

use std::path::PathBuf;
use thiserror::Error;

/// 分段传输错误
#[derive(Debug, Error)]
pub enum TransferError {
    /// 网络错误（连接失败、读取中断、停滞超时）
    #[error("网络错误: {0}")]
    Network(String),
    /// 实际收到的字节数与请求范围不一致
    #[error("数据长度不匹配: 期望 {expected} bytes, 实际 {received} bytes")]
    ShortRead { expected: u64, received: u64 },
    /// 服务器返回异常状态码
    #[error("HTTP 错误: {0}")]
    Status(u16),
    /// 服务器忽略了 Range 请求
    #[error("服务器不支持 Range 请求")]
    RangeUnsupported,
    /// 本地磁盘写入失败
    #[error("写入文件失败: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// 是否为可按网络策略重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Network(_) => true,
            TransferError::Status(code) => matches!(code, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransferError::Status(status.as_u16())
        } else {
            TransferError::Network(e.to_string())
        }
    }
}

/// 解压错误
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("压缩包不存在: {0:?}")]
    NotFound(PathBuf),
    #[error("解压 IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("压缩包格式错误: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// 引擎统一错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 清单条目不合法（在任何传输开始之前报告）
    #[error("清单条目不合法 [{filename}]: {reason}")]
    InvalidManifestEntry { filename: String, reason: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// 校验失败：与网络错误区分，提示用户重新下载
    #[error("文件校验失败（MD5 期望 {expected}，实际 {actual}），损坏的文件已删除，请重试下载")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("解压失败: {0}")]
    Extract(#[from] ExtractError),

    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    #[error("配置不合法: {0}")]
    InvalidConfig(String),

    #[error("创建 HTTP 客户端失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid_entry(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidManifestEntry {
            filename: filename.into(),
            reason: reason.into(),
        }
    }

    /// 是否可以通过任务级重试恢复
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Transfer(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransferError::Network("reset".into()).is_transient());
        assert!(TransferError::Status(503).is_transient());
        assert!(TransferError::Status(429).is_transient());
        assert!(!TransferError::Status(403).is_transient());
        assert!(!TransferError::RangeUnsupported.is_transient());
        assert!(!TransferError::ShortRead {
            expected: 10,
            received: 5
        }
        .is_transient());
    }

    #[test]
    fn test_checksum_message_is_distinct() {
        let e = EngineError::ChecksumMismatch {
            expected: "a".repeat(32),
            actual: "b".repeat(32),
        };
        let msg = e.to_string();
        assert!(msg.contains("MD5"));
        assert!(!msg.contains("网络错误"));
    }
}
