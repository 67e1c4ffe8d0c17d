//! 令牌缓存提供者
//!
//! 在令牌创建提供者之上缓存访问令牌：
//! - 同一服务账号同一时间最多只有一个创建操作，并发调用方共享同一个结果；
//! - 全局信号量限制同时进行的创建数量，超出的请求排队等待；
//! - 令牌在过期前预留安全余量，过了余量视为未命中；
//! - 作为 Pod 和服务账号的监听器，为本节点上的 Pod 预热令牌，
//!   并在服务账号变化、删除或不再被使用时清除缓存。
//!
//! 每个键的状态：不存在 -> 创建中 -> 已缓存 -> {刷新中（继续提供旧值）| 已清除}。

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use gkemd_common::{CachedToken, Error, Result, ServiceAccountReference};
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::create::gcp_service_account;
use super::TokenProvider;
use crate::resources::kind::{is_finished, is_host_network, pod_service_account};
use crate::resources::{Listener, ResourceEvent, WatchedResource};
use crate::utils::cancellable;

/// 默认刷新余量（秒）
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

type Creation = Shared<BoxFuture<'static, Result<Arc<CachedToken>>>>;

/// 令牌缓存配置
#[derive(Clone)]
pub struct CacheProviderOptions {
    /// 实际创建令牌的提供者
    pub source: Arc<dyn TokenProvider>,
    /// 同时进行的创建操作上限
    pub concurrency: usize,
    /// 节点池服务账号，始终保持预热
    pub node_pool_service_account: Option<ServiceAccountReference>,
    /// 过期前预留的安全余量
    pub refresh_margin: Duration,
}

impl CacheProviderOptions {
    /// 使用默认刷新余量创建配置
    pub fn new(source: Arc<dyn TokenProvider>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency,
            node_pool_service_account: None,
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }
}

struct Pending {
    id: u64,
    creation: Creation,
    /// 创建期间条目被清除，结果不再写回，新的创建排在它之后
    stale: bool,
}

#[derive(Default)]
struct Entry {
    token: Option<Arc<CachedToken>>,
    pending: Option<Pending>,
    refresh_timer: Option<CancellationToken>,
}

impl Entry {
    fn cancel_refresh(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.cancel();
        }
    }
}

/// 本节点 Pod 对服务账号的使用情况
#[derive(Default)]
struct Usage {
    /// Pod 对象键 -> 服务账号
    pods: HashMap<String, ServiceAccountReference>,
    /// 服务账号 -> 使用它的 Pod 数量
    users: HashMap<ServiceAccountReference, usize>,
}

struct Inner {
    source: Arc<dyn TokenProvider>,
    semaphore: Semaphore,
    node_pool: Option<ServiceAccountReference>,
    margin: Duration,
    entries: Mutex<HashMap<ServiceAccountReference, Entry>>,
    usage: Mutex<Usage>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    next_id: AtomicU64,
}

impl Inner {
    /// 加入已有的创建操作，或者启动新的创建
    ///
    /// 创建在独立任务中运行，调用方放弃等待不会中断它。
    fn join_or_spawn(self: &Arc<Self>, sa: &ServiceAccountReference, entry: &mut Entry) -> Creation {
        let previous = match &entry.pending {
            Some(pending) if !pending.stale => return pending.creation.clone(),
            Some(pending) => Some(pending.creation.clone()),
            None => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let inner = self.clone();
        let key = sa.clone();
        self.tasks.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = inner.create(&key, id).await;
            let _ = tx.send(result);
        });

        let creation = async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::Shutdown("令牌创建任务已退出".to_string())))
        }
        .boxed()
        .shared();
        entry.pending = Some(Pending {
            id,
            creation: creation.clone(),
            stale: false,
        });
        creation
    }

    async fn create(self: &Arc<Self>, sa: &ServiceAccountReference, id: u64) -> Result<Arc<CachedToken>> {
        let result = async {
            let _permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Shutdown("令牌缓存已关闭".to_string()));
                }
                permit = self.semaphore.acquire() => {
                    permit.map_err(|_| Error::Shutdown("令牌缓存已关闭".to_string()))?
                }
            };
            debug!(service_account = %sa, "开始创建令牌");
            // 来源 panic 时仍要走下面的清理，否则该键会一直停在创建中
            AssertUnwindSafe(self.source.get(sa))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Unknown("令牌创建过程中发生 panic".to_string())))
        }
        .await;

        let tracked = self.is_tracked(sa).await;
        {
            let mut entries = self.entries.lock().await;
            let current = entries
                .get(sa)
                .and_then(|entry| entry.pending.as_ref())
                .map(|pending| (pending.id, pending.stale));

            // 创建期间条目被清除或替换时不写回
            if let Some((_, stale)) = current.filter(|(current, _)| *current == id) {
                let mut remove = false;
                if let Some(entry) = entries.get_mut(sa) {
                    entry.pending = None;
                    match &result {
                        Ok(_) if stale => remove = entry.token.is_none(),
                        Ok(token) => {
                            entry.token = Some(token.clone());
                            if tracked {
                                self.schedule_refresh(sa, entry, token);
                            }
                        }
                        Err(_) => {
                            remove = entry.token.as_ref().map_or(true, |t| t.is_expired());
                        }
                    }
                }
                if remove {
                    if let Some(mut entry) = entries.remove(sa) {
                        entry.cancel_refresh();
                    }
                }
            }
        }

        match &result {
            Ok(token) => debug!(
                service_account = %sa,
                expires_at = %token.expires_at(),
                "令牌已缓存"
            ),
            Err(e) => warn!(service_account = %sa, error = %e, "令牌创建失败"),
        }
        result
    }

    /// 在过期前余量处安排后台刷新
    fn schedule_refresh(
        self: &Arc<Self>,
        sa: &ServiceAccountReference,
        entry: &mut Entry,
        token: &CachedToken,
    ) {
        entry.cancel_refresh();

        let delay = match (token.refresh_at(self.margin) - Utc::now()).to_std() {
            Ok(delay) if !delay.is_zero() => delay,
            _ => {
                debug!(service_account = %sa, "令牌有效期短于刷新余量，不安排主动刷新");
                return;
            }
        };

        let timer = self.cancel.child_token();
        entry.refresh_timer = Some(timer.clone());
        let inner = self.clone();
        let key = sa.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.refresh(&key).await,
            }
        });
    }

    async fn refresh(self: &Arc<Self>, sa: &ServiceAccountReference) {
        let creation = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(sa) else {
                return;
            };
            entry.refresh_timer = None;
            self.join_or_spawn(sa, entry)
        };

        debug!(service_account = %sa, "后台刷新令牌");
        if let Err(e) = creation.await {
            error!(
                service_account = %sa,
                error = %e,
                "后台刷新失败，在旧令牌过期前继续使用"
            );
        }
    }

    /// 预热：没有新鲜令牌且没有进行中的创建时在后台启动创建
    async fn warm(self: &Arc<Self>, sa: &ServiceAccountReference) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(sa.clone()).or_default();
        if entry.pending.as_ref().is_some_and(|pending| !pending.stale) {
            return;
        }
        if let Some(token) = entry.token.clone() {
            if token.is_fresh(self.margin) {
                if entry.refresh_timer.is_none() {
                    self.schedule_refresh(sa, entry, &token);
                }
                return;
            }
        }

        debug!(service_account = %sa, "预热令牌");
        let _ = self.join_or_spawn(sa, entry);
    }

    /// 清除令牌
    ///
    /// 进行中的创建保留为过期状态，结果不写回，之后的创建等它结束再开始，
    /// 保证同一个键同时只有一个创建。
    async fn evict(&self, sa: &ServiceAccountReference) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(sa) else {
            return;
        };
        entry.cancel_refresh();
        entry.token = None;
        match entry.pending.as_mut() {
            Some(pending) => pending.stale = true,
            None => {
                entries.remove(sa);
            }
        }
        debug!(service_account = %sa, "清除缓存的令牌");
    }

    async fn is_tracked(&self, sa: &ServiceAccountReference) -> bool {
        if self.node_pool.as_ref() == Some(sa) {
            return true;
        }
        self.usage.lock().await.users.contains_key(sa)
    }

    /// 更新 Pod 的服务账号归属，返回不再被使用的服务账号
    async fn track_pod(
        &self,
        pod_key: String,
        next: Option<ServiceAccountReference>,
    ) -> Option<ServiceAccountReference> {
        let mut usage = self.usage.lock().await;
        let previous = match &next {
            Some(sa) => usage.pods.insert(pod_key, sa.clone()),
            None => usage.pods.remove(&pod_key),
        };
        if previous == next {
            return None;
        }

        if let Some(sa) = &next {
            *usage.users.entry(sa.clone()).or_default() += 1;
        }

        let previous = previous?;
        let remaining = match usage.users.get_mut(&previous) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return None;
        }
        usage.users.remove(&previous);
        (self.node_pool.as_ref() != Some(&previous)).then_some(previous)
    }
}

/// 令牌缓存提供者
#[derive(Clone)]
pub struct CacheProvider {
    inner: Arc<Inner>,
}

impl CacheProvider {
    /// 创建新的令牌缓存
    pub fn new(options: CacheProviderOptions) -> Result<Self> {
        if options.concurrency == 0 {
            return Err(Error::Config("令牌缓存并发数必须为正整数".to_string()));
        }
        if options.refresh_margin < Duration::zero() {
            return Err(Error::Config("刷新余量不能为负".to_string()));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                source: options.source,
                semaphore: Semaphore::new(options.concurrency),
                node_pool: options.node_pool_service_account,
                margin: options.refresh_margin,
                entries: Mutex::new(HashMap::new()),
                usage: Mutex::new(Usage::default()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// 启动缓存，预热节点池服务账号
    pub async fn start(&self) {
        info!(
            concurrency = self.inner.semaphore.available_permits(),
            node_pool = ?self.inner.node_pool,
            "启动令牌缓存"
        );
        if let Some(sa) = &self.inner.node_pool {
            self.inner.warm(sa).await;
        }
    }

    /// 关闭缓存
    ///
    /// 取消所有刷新定时器和排队中的创建，等待进行中的创建结束。
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.entries.lock().await.clear();
        info!("令牌缓存已关闭");
    }

    /// 获取令牌
    ///
    /// 新鲜的缓存直接返回；过了刷新余量但尚未过期且已有刷新在进行时返回旧值；
    /// 其他情况加入或启动创建并等待结果。
    pub async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<CachedToken>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Shutdown("令牌缓存已关闭".to_string()));
        }

        let (previous, creation) = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries.entry(sa.clone()).or_default();
            if let Some(token) = &entry.token {
                if token.is_fresh(self.inner.margin) {
                    return Ok(token.clone());
                }
                if entry.pending.is_some() && !token.is_expired() {
                    return Ok(token.clone());
                }
            }
            (entry.token.clone(), self.inner.join_or_spawn(sa, entry))
        };

        match creation.await {
            Ok(token) => Ok(token),
            Err(e) => match previous {
                Some(token) if !token.is_expired() => {
                    warn!(
                        service_account = %sa,
                        error = %e,
                        "令牌刷新失败，返回尚未过期的旧令牌"
                    );
                    Ok(token)
                }
                _ => Err(e),
            },
        }
    }

    /// 获取令牌，取消信号触发时立即返回，不影响其他等待同一创建的调用方
    pub async fn get_with_cancel(
        &self,
        sa: &ServiceAccountReference,
        cancel: &CancellationToken,
    ) -> Result<Arc<CachedToken>> {
        cancellable(cancel, self.get(sa)).await
    }

    /// 在后台确保服务账号的令牌已缓存
    pub async fn ensure_cached(&self, sa: &ServiceAccountReference) {
        self.inner.warm(sa).await;
    }

    /// 清除服务账号的缓存
    pub async fn evict(&self, sa: &ServiceAccountReference) {
        self.inner.evict(sa).await;
    }

    /// 当前缓存的令牌（不触发创建）
    pub async fn cached(&self, sa: &ServiceAccountReference) -> Option<Arc<CachedToken>> {
        self.inner
            .entries
            .lock()
            .await
            .get(sa)
            .and_then(|entry| entry.token.clone())
    }

    /// 节点池服务账号
    pub fn node_pool_service_account(&self) -> Option<&ServiceAccountReference> {
        self.inner.node_pool.as_ref()
    }
}

#[async_trait]
impl TokenProvider for CacheProvider {
    async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<CachedToken>> {
        CacheProvider::get(self, sa).await
    }
}

#[async_trait]
impl Listener<Pod> for CacheProvider {
    async fn on_event(&self, event: ResourceEvent<Pod>) {
        let pod = event.object();
        // 主机网络 Pod 不归属到自己的服务账号，已结束的 Pod 视同删除
        let active = !matches!(event, ResourceEvent::Deleted(_))
            && !is_finished(pod)
            && !is_host_network(pod);
        let next = if active {
            match pod_service_account(pod) {
                Ok(sa) => Some(sa),
                Err(e) => {
                    warn!(pod = %event.key(), error = %e, "无法确定 Pod 的服务账号");
                    None
                }
            }
        } else {
            None
        };

        if let Some(unused) = self.inner.track_pod(event.key(), next.clone()).await {
            debug!(service_account = %unused, "服务账号不再被本节点 Pod 使用");
            self.inner.evict(&unused).await;
        }
        if let Some(sa) = next {
            self.inner.warm(&sa).await;
        }
    }
}

#[async_trait]
impl Listener<ServiceAccount> for CacheProvider {
    async fn on_event(&self, event: ResourceEvent<ServiceAccount>) {
        let Some(sa) = event.object().index_keys().into_iter().next() else {
            return;
        };

        match &event {
            ResourceEvent::Added(_) => {
                if self.inner.is_tracked(&sa).await {
                    self.inner.warm(&sa).await;
                }
            }
            ResourceEvent::Updated { old, new } => {
                if gcp_service_account(old) != gcp_service_account(new) {
                    info!(service_account = %sa, "GCP 服务账号绑定已变化，清除缓存");
                    self.inner.evict(&sa).await;
                    if self.inner.is_tracked(&sa).await {
                        self.inner.warm(&sa).await;
                    }
                }
            }
            ResourceEvent::Deleted(_) => {
                info!(service_account = %sa, "服务账号已删除，清除缓存");
                self.inner.evict(&sa).await;
            }
        }
    }
}
