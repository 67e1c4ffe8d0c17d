//! 控制核心工具函数
//!
//! 包括取消/超时包装、重连退避以及日志中使用的时长格式化。

use gkemd_common::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 在取消信号触发时立即返回 `Error::Cancelled`
///
/// 被放弃的只是调用方自己的等待，已经在后台运行的任务不受影响。
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled("调用方取消了请求".to_string())),
        result = fut => result,
    }
}

/// 为操作设置截止时间，超时返回 `Error::Cancelled`
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled(format!(
            "操作超过截止时间 {}",
            format_duration(deadline)
        ))),
    }
}

/// 指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// 创建新的退避器
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 返回本次等待时长并把下一次翻倍
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 成功后重置
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// 格式化持续时间为人类可读的字符串
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();

    if seconds == 0 {
        return format!("{} 毫秒", duration.as_millis());
    }

    if seconds < 60 {
        return format!("{} 秒", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} 分钟 {} 秒", minutes, seconds % 60);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} 小时 {} 分钟", hours, minutes % 60);
    }

    let days = hours / 24;
    format!("{} 天 {} 小时", days, hours % 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250 毫秒");
        assert_eq!(format_duration(Duration::from_secs(30)), "30 秒");
        assert_eq!(format_duration(Duration::from_secs(90)), "1 分钟 30 秒");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1 小时 0 分钟");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1 天 0 小时");
    }

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(result.unwrap_err().is_cancelled());

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let result: Result<()> =
            with_deadline(Duration::from_millis(10), std::future::pending()).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
