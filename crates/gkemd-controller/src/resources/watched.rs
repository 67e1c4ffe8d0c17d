//! 监听型资源提供者
//!
//! 通过先列举再监听维护资源的本地镜像，`get` 只读取镜像。
//! 定期全量同步会重新建立事件流，从而修复可能丢失的删除事件。
//! 镜像更新完成后才向监听器分发事件，监听器在回调中调用 `get` 能看到新状态。

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use gkemd_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{Listener, Provider, ResourceEvent, WatchEvent, WatchSource, WatchedResource};
use crate::utils::{format_duration, Backoff};

/// 每个监听器的事件队列长度
const LISTENER_QUEUE_SIZE: usize = 100;

/// 监听型提供者配置
#[derive(Debug, Clone, Default)]
pub struct WatchedProviderOptions {
    /// 全量同步周期，为零时只依赖监听
    pub resync_period: Duration,
}

/// 资源镜像
struct Mirror<K: WatchedResource> {
    /// 对象键 -> 最新对象
    objects: HashMap<String, Arc<K>>,
    /// 查找键 -> 对象键
    index: HashMap<K::Key, String>,
    /// 是否完成过完整列举
    synced: bool,
}

impl<K: WatchedResource> Mirror<K> {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
            index: HashMap::new(),
            synced: false,
        }
    }

    fn get(&self, key: &K::Key) -> Option<Arc<K>> {
        self.index
            .get(key)
            .and_then(|object_key| self.objects.get(object_key))
            .cloned()
    }

    fn unindex(&mut self, object_key: &str, obj: &K) {
        for key in obj.index_keys() {
            if self.index.get(&key).map(String::as_str) == Some(object_key) {
                self.index.remove(&key);
            }
        }
    }

    fn upsert(&mut self, obj: Arc<K>) -> ResourceEvent<K> {
        let object_key = obj.object_key();
        let old = self.objects.insert(object_key.clone(), obj.clone());
        if let Some(old) = &old {
            self.unindex(&object_key, old);
        }
        for key in obj.index_keys() {
            self.index.insert(key, object_key.clone());
        }

        match old {
            Some(old) => ResourceEvent::Updated { old, new: obj },
            None => ResourceEvent::Added(obj),
        }
    }

    fn remove(&mut self, obj: &K) -> ResourceEvent<K> {
        let object_key = obj.object_key();
        match self.objects.remove(&object_key) {
            Some(old) => {
                self.unindex(&object_key, &old);
                ResourceEvent::Deleted(old)
            }
            None => ResourceEvent::Deleted(Arc::new(obj.clone())),
        }
    }

    /// 用完整列举结果对齐镜像，返回需要分发的差异事件
    fn reconcile(&mut self, objects: Vec<K>) -> Vec<ResourceEvent<K>> {
        let mut events = Vec::new();
        let listed: HashMap<String, K> = objects
            .into_iter()
            .map(|obj| (obj.object_key(), obj))
            .collect();

        let missing: Vec<Arc<K>> = self
            .objects
            .iter()
            .filter(|(object_key, _)| !listed.contains_key(*object_key))
            .map(|(_, obj)| obj.clone())
            .collect();
        for obj in missing {
            events.push(self.remove(&obj));
        }

        for (object_key, obj) in listed {
            let unchanged = match (self.objects.get(&object_key), obj.version()) {
                (Some(current), Some(version)) => {
                    current.version().as_deref() == Some(version.as_str())
                }
                _ => false,
            };
            if !unchanged {
                events.push(self.upsert(Arc::new(obj)));
            }
        }

        self.synced = true;
        events
    }

    fn apply(&mut self, event: WatchEvent<K>) -> Vec<ResourceEvent<K>> {
        match event {
            WatchEvent::Applied(obj) => vec![self.upsert(Arc::new(obj))],
            WatchEvent::Deleted(obj) => vec![self.remove(&obj)],
            WatchEvent::Restarted(objects) => self.reconcile(objects),
        }
    }
}

struct Inner<K: WatchedResource> {
    source: Arc<dyn WatchSource<K>>,
    options: WatchedProviderOptions,
    mirror: RwLock<Mirror<K>>,
    listeners: RwLock<Vec<mpsc::Sender<ResourceEvent<K>>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<K: WatchedResource> Inner<K> {
    async fn apply(&self, event: WatchEvent<K>) {
        let events = {
            let mut mirror = self.mirror.write().await;
            mirror.apply(event)
        };
        self.publish(events).await;
    }

    async fn publish(&self, events: Vec<ResourceEvent<K>>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().await;
        for event in events {
            debug!(kind = %K::KIND, key = %event.key(), "分发资源事件");
            for listener in listeners.iter() {
                if listener.send(event.clone()).await.is_err() {
                    debug!(kind = %K::KIND, "监听器已退出，丢弃事件");
                }
            }
        }
    }

    fn resync_timer(&self) -> Option<Interval> {
        let period = self.options.resync_period;
        if period.is_zero() {
            return None;
        }
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }

    /// 持续运行的监听循环
    async fn run(self: Arc<Self>, mut stream: BoxStream<'static, Result<WatchEvent<K>>>) {
        let mut resync = self.resync_timer();
        let mut backoff = Backoff::default();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(kind = %K::KIND, "监听循环已停止");
                    return;
                }
                _ = async {
                    match resync.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    debug!(
                        kind = %K::KIND,
                        period = %format_duration(self.options.resync_period),
                        "开始全量同步"
                    );
                    stream = self.source.watch();
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        backoff.reset();
                        self.apply(event).await;
                    }
                    Some(Err(e)) => {
                        warn!(kind = %K::KIND, error = %e, "监听出错，等待数据源重试");
                    }
                    None => {
                        let delay = backoff.next_delay();
                        warn!(
                            kind = %K::KIND,
                            delay = %format_duration(delay),
                            "监听流已结束，准备重新连接"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => continue,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        stream = self.source.watch();
                    }
                }
            }
        }
    }
}

/// 监听型资源提供者
pub struct WatchedProvider<K: WatchedResource> {
    inner: Arc<Inner<K>>,
    started: AtomicBool,
}

impl<K: WatchedResource> WatchedProvider<K> {
    /// 创建新的监听型提供者
    pub fn new(source: Arc<dyn WatchSource<K>>, options: WatchedProviderOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                options,
                mirror: RwLock::new(Mirror::new()),
                listeners: RwLock::new(Vec::new()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// 注册监听器
    ///
    /// 应当在 `start` 之前注册，之后注册的监听器会错过已经发生的事件。
    /// 每个监听器都有自己的处理任务，必须在 tokio 运行时中调用。
    pub async fn add_listener(&self, listener: Arc<dyn Listener<K>>) {
        if self.started.load(Ordering::SeqCst) {
            warn!(kind = %K::KIND, "监听器在启动之后注册，可能错过之前的事件");
        }

        let (tx, mut rx) = mpsc::channel::<ResourceEvent<K>>(LISTENER_QUEUE_SIZE);
        let cancel = self.inner.cancel.clone();
        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => listener.on_event(event).await,
                        None => break,
                    },
                }
            }
        });

        self.inner.listeners.write().await.push(tx);
    }

    /// 启动监听
    ///
    /// 等待初始列举完成后在后台运行监听循环。初始列举失败会直接返回错误，
    /// 之后的监听和全量同步错误只记录日志并自动重试。
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config(format!("{} 提供者已经启动", K::KIND)));
        }

        info!(
            kind = %K::KIND,
            resync_period = %format_duration(self.inner.options.resync_period),
            "启动资源监听"
        );

        let mut stream = self.inner.source.watch();
        match stream.next().await {
            Some(Ok(event)) => self.inner.apply(event).await,
            Some(Err(e)) => {
                error!(kind = %K::KIND, error = %e, "初始列举失败");
                return Err(e);
            }
            None => {
                return Err(Error::Watch(format!(
                    "{} 监听流在初始列举前结束",
                    K::KIND
                )))
            }
        }

        info!(kind = %K::KIND, objects = self.len().await, "初始列举完成");
        self.inner.tasks.spawn(self.inner.clone().run(stream));
        Ok(())
    }

    /// 停止监听并等待后台任务退出
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(kind = %K::KIND, "资源监听已关闭");
    }

    /// 是否完成过完整列举
    pub async fn is_synced(&self) -> bool {
        self.inner.mirror.read().await.synced
    }

    /// 镜像中的对象数量
    pub async fn len(&self) -> usize {
        self.inner.mirror.read().await.objects.len()
    }

    /// 镜像是否为空
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<K: WatchedResource> Provider<K> for WatchedProvider<K> {
    async fn get(&self, key: &K::Key) -> Result<Arc<K>> {
        let mirror = self.inner.mirror.read().await;
        match mirror.get(key) {
            Some(obj) => Ok(obj),
            None if !mirror.synced => Err(Error::NotFound(format!(
                "{} {} 不在本地镜像中（镜像尚未同步）",
                K::KIND,
                key
            ))),
            None => Err(Error::NotFound(format!(
                "{} {} 不在本地镜像中",
                K::KIND,
                key
            ))),
        }
    }
}
