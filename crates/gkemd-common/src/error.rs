//! 错误处理模块
//!
//! 该模块提供 GKEMD 项目的统一错误处理机制。错误按照处理方式分类：
//! 配置错误在启动时致命，解析错误表示资源不存在，交换错误可重试，
//! 取消/超时与真正的失败相互区分，便于调用方决定是否重试。

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// GKEMD 统一错误类型
///
/// 实现了 `Clone`，同一次令牌创建失败可以原样分发给所有等待中的调用方。
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// 配置错误（启动时致命）
    #[error("配置错误: {0}")]
    Config(String),

    /// 资源未找到
    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 令牌交换错误（可重试）
    #[error("令牌交换错误: {0}")]
    Exchange(String),

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kubernetes(String),

    /// 监听基础设施错误
    #[error("监听错误: {0}")]
    Watch(String),

    /// 操作被取消或超时
    #[error("操作已取消: {0}")]
    Cancelled(String),

    /// 组件已关闭
    #[error("组件已关闭: {0}")]
    Shutdown(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(Arc<io::Error>),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(Arc<serde_json::Error>),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl Error {
    /// 是否为资源未找到
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Exchange(_) | Error::Kubernetes(_) | Error::Watch(_) | Error::Io(_)
        )
    }

    /// 是否为取消或超时
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

/// GKEMD 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// 从字符串创建错误
pub trait IntoError<T> {
    /// 将当前类型转换为错误
    fn into_error(self, kind: fn(String) -> Error) -> Result<T>;
}

impl<T> IntoError<T> for String {
    fn into_error(self, kind: fn(String) -> Error) -> Result<T> {
        Err(kind(self))
    }
}

impl<T> IntoError<T> for &str {
    fn into_error(self, kind: fn(String) -> Error) -> Result<T> {
        Err(kind(self.to_string()))
    }
}
