//! 令牌提供者
//!
//! [`CreationProvider`] 每次都完成一次完整的令牌交换，
//! [`CacheProvider`] 在其之上提供按服务账号去重、限流和主动刷新的缓存。

mod cache;
mod create;
mod identity;

pub use cache::{CacheProvider, CacheProviderOptions, DEFAULT_REFRESH_MARGIN_SECS};
pub use create::{
    gcp_service_account, CreationProvider, IdentityTokenIssuer, KubeTokenIssuer,
    GCP_SERVICE_ACCOUNT_ANNOTATION,
};
pub use identity::PodIdentityResolver;

use async_trait::async_trait;
use gkemd_common::{CachedToken, Result, ServiceAccountReference};
use std::sync::Arc;

/// 按服务账号签发 GCP 访问令牌
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 获取服务账号对应的访问令牌
    async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<CachedToken>>;
}
