//! 访问令牌模型
//!
//! 令牌缓存发布的令牌值。发布后不可变，刷新会产生新的令牌并整体替换旧值。

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// 已缓存的访问令牌
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// 创建新的令牌
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// 根据有效期创建令牌，过期时间超出可表示范围时返回 `None`
    pub fn try_expiring_in(access_token: impl Into<String>, ttl: Duration) -> Option<Self> {
        let expires_at = Utc::now().checked_add_signed(ttl)?;
        Some(Self::new(access_token, expires_at))
    }

    /// 根据有效期创建令牌，超出范围时取最大可表示时间
    pub fn expiring_in(access_token: impl Into<String>, ttl: Duration) -> Self {
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(access_token, expires_at)
    }

    /// 访问令牌
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// 过期时间
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// 剩余有效期（已过期时为零）
    pub fn expires_in(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }

    /// 是否已经过期
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// 在预留安全余量后是否仍然新鲜
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Utc::now() < self.refresh_at(margin)
    }

    /// 应当开始主动刷新的时间点
    pub fn refresh_at(&self, margin: Duration) -> DateTime<Utc> {
        self.expires_at
            .checked_sub_signed(margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

// 不输出令牌内容
impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness() {
        let token = CachedToken::expiring_in("ya29.a", Duration::hours(1));
        assert!(!token.is_expired());
        assert!(token.is_fresh(Duration::minutes(5)));
        assert!(!token.is_fresh(Duration::hours(2)));
        assert_eq!(token.access_token(), "ya29.a");
    }

    #[test]
    fn test_expired() {
        let token = CachedToken::expiring_in("ya29.b", Duration::seconds(-1));
        assert!(token.is_expired());
        assert_eq!(token.expires_in(), Duration::zero());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let ttl = Duration::seconds(i64::MAX / 1000);
        assert!(CachedToken::try_expiring_in("ya29.c", ttl).is_none());
        assert!(CachedToken::try_expiring_in("ya29.c", Duration::hours(1)).is_some());

        let token = CachedToken::expiring_in("ya29.c", ttl);
        assert_eq!(token.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(token.is_fresh(Duration::minutes(5)));
    }

    #[test]
    fn test_debug_hides_token() {
        let token = CachedToken::expiring_in("secret-value", Duration::hours(1));
        assert!(!format!("{:?}", token).contains("secret-value"));
    }
}
