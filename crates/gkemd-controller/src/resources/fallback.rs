//! 带回退的提供者

use async_trait::async_trait;
use gkemd_common::Result;
use std::sync::Arc;
use tracing::debug;

use super::{Provider, WatchedResource};

/// 主提供者返回未找到时委托给回退提供者
///
/// 只有未找到会触发回退，其他错误原样返回。
pub struct FallbackProvider<K: WatchedResource> {
    primary: Arc<dyn Provider<K>>,
    fallback: Arc<dyn Provider<K>>,
}

impl<K: WatchedResource> FallbackProvider<K> {
    /// 创建新的回退提供者
    pub fn new(primary: Arc<dyn Provider<K>>, fallback: Arc<dyn Provider<K>>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<K: WatchedResource> Provider<K> for FallbackProvider<K> {
    async fn get(&self, key: &K::Key) -> Result<Arc<K>> {
        match self.primary.get(key).await {
            Err(e) if e.is_not_found() => {
                debug!(kind = %K::KIND, key = %key, "本地镜像未命中，回退到直接查询");
                self.fallback.get(key).await
            }
            result => result,
        }
    }
}
