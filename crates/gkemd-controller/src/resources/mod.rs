//! 资源提供者模块
//!
//! 按键解析 Kubernetes 资源（节点上的 Pod、节点本身、集群中的服务账号）。
//! 三种策略通过组合而不是继承实现：
//! - 直接调用：每次都访问 API，见 [`cluster`] 中的数据源；
//! - 监听缓存：先列举再监听的本地镜像，见 [`WatchedProvider`]；
//! - 带回退的监听缓存：镜像未命中时委托给直接调用，见 [`FallbackProvider`]。
//!
//! 监听型提供者在镜像更新之后把添加/更新/删除事件分发给已注册的监听器。

pub(crate) mod fallback;
pub mod kind;
pub mod cluster;
pub(crate) mod watched;

pub use fallback::FallbackProvider;
pub use kind::{ResourceKind, WatchedResource};
pub use watched::{WatchedProvider, WatchedProviderOptions};

use async_trait::async_trait;
use futures::stream::BoxStream;
use gkemd_common::Result;
use std::sync::Arc;

/// 资源提供者
#[async_trait]
pub trait Provider<K: WatchedResource>: Send + Sync {
    /// 按键获取资源
    async fn get(&self, key: &K::Key) -> Result<Arc<K>>;
}

/// 数据源产生的监听事件
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// 资源被创建或修改
    Applied(K),
    /// 资源被删除
    Deleted(K),
    /// 完整列举结果（初始列举、重新列举或定期全量同步）
    Restarted(Vec<K>),
}

/// 先列举再监听的数据源
///
/// 每次调用 `watch` 都返回一个新的事件流，第一个事件是完整列举。
/// 断线重连、资源版本过期后的重新列举由数据源自身负责。
pub trait WatchSource<K>: Send + Sync {
    /// 启动新的事件流
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// 分发给监听器的资源事件
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    /// 新出现的资源
    Added(Arc<K>),
    /// 已有资源发生变化
    Updated {
        /// 变化前
        old: Arc<K>,
        /// 变化后
        new: Arc<K>,
    },
    /// 资源被删除
    Deleted(Arc<K>),
}

impl<K: WatchedResource> ResourceEvent<K> {
    /// 资源类型
    pub fn kind(&self) -> ResourceKind {
        K::KIND
    }

    /// 事件涉及的资源的最新状态
    pub fn object(&self) -> &Arc<K> {
        match self {
            ResourceEvent::Added(obj) | ResourceEvent::Deleted(obj) => obj,
            ResourceEvent::Updated { new, .. } => new,
        }
    }

    /// 受影响资源的对象键
    pub fn key(&self) -> String {
        self.object().object_key()
    }
}

/// 资源事件监听器
///
/// 每个监听器拥有独立的处理任务，事件按监听流观察到的顺序逐个投递。
#[async_trait]
pub trait Listener<K: WatchedResource>: Send + Sync {
    /// 处理一个资源事件
    async fn on_event(&self, event: ResourceEvent<K>);
}

/// 按配置组合提供者
///
/// 未启用监听时直接使用 `direct`；启用监听且未禁用回退时用
/// [`FallbackProvider`] 包装监听缓存与直接调用。
pub fn compose<K: WatchedResource>(
    direct: Arc<dyn Provider<K>>,
    watched: Option<Arc<WatchedProvider<K>>>,
    disable_fallback: bool,
) -> Arc<dyn Provider<K>> {
    match watched {
        None => direct,
        Some(watched) if disable_fallback => watched,
        Some(watched) => Arc::new(FallbackProvider::new(watched, direct)),
    }
}
