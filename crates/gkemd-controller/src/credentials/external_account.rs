//! external account 凭据
//!
//! 凭据描述交给 `google-cloud-auth` 的 external account 构造器，
//! STS 交换和服务账号模拟都由 SDK 完成，这里只负责取出访问令牌并记录过期时间。

use chrono::{Duration, Utc};
use gkemd_common::{CachedToken, Error, Result};
use google_cloud_auth::credentials::external_account::Builder;
use google_cloud_auth::credentials::{CacheableResource, Credentials};
use http::header::AUTHORIZATION;
use http::{Extensions, HeaderMap};

use super::{ExternalAccountDescriptor, EXTERNAL_ACCOUNT_TYPE};

/// 联合令牌和模拟令牌的有效期上限
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// external account 凭据
#[derive(Debug, Clone)]
pub struct ExternalAccountCredentials {
    descriptor: ExternalAccountDescriptor,
    scopes: Vec<String>,
    credentials: Credentials,
}

impl ExternalAccountCredentials {
    /// 从凭据描述构造
    pub fn from_descriptor(descriptor: ExternalAccountDescriptor, scopes: &[&str]) -> Result<Self> {
        if descriptor.credential_type != EXTERNAL_ACCOUNT_TYPE {
            return Err(Error::Config(format!(
                "不支持的凭据类型 {:?}",
                descriptor.credential_type
            )));
        }

        let json = serde_json::to_value(&descriptor)?;
        let credentials = Builder::new(json)
            .with_scopes(scopes.iter().copied())
            .build()
            .map_err(|e| Error::Config(format!("无法构造 external account 凭据: {}", e)))?;

        Ok(Self {
            descriptor,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            credentials,
        })
    }

    /// 凭据描述
    pub fn descriptor(&self) -> &ExternalAccountDescriptor {
        &self.descriptor
    }

    /// 访问范围
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// 签发访问令牌
    ///
    /// SDK 不返回过期时间。两种令牌的有效期都不超过一小时且在交换开始之后签发，
    /// 因此以交换开始时间加一小时作为过期时间。
    pub async fn token(&self) -> Result<CachedToken> {
        let started = Utc::now();
        let resource = self
            .credentials
            .headers(Extensions::new())
            .await
            .map_err(|e| Error::Exchange(format!("令牌交换失败: {}", e)))?;
        let CacheableResource::New { data, .. } = resource else {
            return Err(Error::Exchange("凭据没有返回新的请求头".to_string()));
        };

        let access_token = bearer_token(&data)?;
        let expires_at = started
            .checked_add_signed(Duration::seconds(TOKEN_LIFETIME_SECS))
            .ok_or_else(|| Error::Exchange("令牌过期时间超出范围".to_string()))?;
        Ok(CachedToken::new(access_token, expires_at))
    }
}

/// 从请求头中取出 Bearer 令牌
fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::Exchange("凭据请求头中没有 authorization".to_string()))?;
    let value = value
        .to_str()
        .map_err(|e| Error::Exchange(format!("authorization 请求头无效: {}", e)))?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(Error::Exchange("authorization 请求头不是 Bearer 令牌".to_string())),
    }
}
