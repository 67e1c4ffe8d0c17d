//! GKEMD Agent - 节点上的元数据服务模拟器守护进程
//!
//! 该模块按配置组装凭据签发管线：Pod、节点和服务账号提供者（直接查询、
//! 监听缓存或带回退的监听缓存），令牌创建提供者以及可选的令牌缓存，
//! 并负责它们的启动和关闭顺序。

pub mod config;

use anyhow::{Context, Result};
use gkemd_common::{CachedToken, ServiceAccountReference};
use gkemd_controller::credentials::{self, ConfigOptions};
use gkemd_controller::resources::cluster::{NodeSource, PodSource, ServiceAccountSource};
use gkemd_controller::tokens::KubeTokenIssuer;
use gkemd_controller::{
    compose, CacheProvider, CacheProviderOptions, CreationProvider, PodIdentityResolver, Provider,
    TokenProvider, WatchedProvider, WatchedProviderOptions, WatchedResource,
};
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use kube::Client;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

use crate::config::{AgentConfig, NodeEnvironment, WatchConfig};

/// 按配置组合某一类资源的提供者
fn build_provider<K, S>(
    source: S,
    watch: &WatchConfig,
) -> (Arc<dyn Provider<K>>, Option<Arc<WatchedProvider<K>>>)
where
    K: WatchedResource,
    S: Provider<K> + gkemd_controller::WatchSource<K> + Clone + 'static,
{
    let watched = watch.enabled.then(|| {
        Arc::new(WatchedProvider::new(
            Arc::new(source.clone()),
            WatchedProviderOptions {
                resync_period: watch.resync_period(),
            },
        ))
    });
    let provider = compose(Arc::new(source), watched.clone(), watch.disable_fallback);
    (provider, watched)
}

/// Agent 主结构体
pub struct Agent {
    /// 当前配置
    config: AgentConfig,
    /// 进程环境
    env: NodeEnvironment,
    /// workload identity pool 名称
    workload_identity_pool: String,
    /// 本节点上的 Pod
    pods: Arc<dyn Provider<Pod>>,
    /// 本节点
    node: Arc<dyn Provider<Node>>,
    /// 集群中的服务账号
    service_accounts: Arc<dyn Provider<ServiceAccount>>,
    /// 令牌提供者（启用缓存时为缓存）
    tokens: Arc<dyn TokenProvider>,
    /// 令牌缓存
    cache: Option<CacheProvider>,
    /// 监听型提供者
    watched_pods: Option<Arc<WatchedProvider<Pod>>>,
    watched_node: Option<Arc<WatchedProvider<Node>>>,
    watched_service_accounts: Option<Arc<WatchedProvider<ServiceAccount>>>,
    /// Pod 身份解析器
    resolver: PodIdentityResolver,
}

impl Agent {
    /// 创建新的 Agent 实例
    pub async fn new(config: AgentConfig, env: NodeEnvironment) -> Result<Self> {
        config.validate()?;
        let client = Client::try_default()
            .await
            .context("无法创建 Kubernetes 客户端")?;
        Self::with_client(config, env, client)
    }

    /// 使用给定的 Kubernetes 客户端创建 Agent
    pub fn with_client(config: AgentConfig, env: NodeEnvironment, client: Client) -> Result<Self> {
        config.validate()?;
        let node_pool = config.node_pool_service_account()?;
        let (credentials, workload_identity_pool) = credentials::Config::new(ConfigOptions {
            workload_identity_provider: config.workload_identity_provider.clone(),
        })?;

        let (pods, watched_pods) = build_provider(
            PodSource::new(client.clone(), env.node_name.clone()),
            &config.watch_pods,
        );
        let (node, watched_node) = build_provider(
            NodeSource::new(client.clone(), env.node_name.clone()),
            &config.watch_node,
        );
        let (service_accounts, watched_service_accounts) = build_provider(
            ServiceAccountSource::new(client.clone()),
            &config.watch_service_accounts,
        );

        let creation: Arc<dyn TokenProvider> = Arc::new(CreationProvider::new(
            Arc::new(credentials),
            Arc::new(KubeTokenIssuer::new(client)),
            service_accounts.clone(),
        ));

        let cache = if config.cache_tokens.enabled {
            let mut options =
                CacheProviderOptions::new(creation.clone(), config.cache_tokens.concurrency);
            options.node_pool_service_account = node_pool.clone();
            Some(CacheProvider::new(options)?)
        } else {
            None
        };
        let tokens: Arc<dyn TokenProvider> = match &cache {
            Some(cache) => Arc::new(cache.clone()),
            None => creation,
        };

        let resolver = PodIdentityResolver::new(pods.clone(), node_pool);

        Ok(Self {
            config,
            env,
            workload_identity_pool,
            pods,
            node,
            service_accounts,
            tokens,
            cache,
            watched_pods,
            watched_node,
            watched_service_accounts,
            resolver,
        })
    }

    /// 启动 Agent
    ///
    /// 先注册监听器，再启动各资源监听（初始列举失败会直接返回错误），最后启动令牌缓存。
    pub async fn start(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            if let Some(watched) = &self.watched_pods {
                watched.add_listener(Arc::new(cache.clone())).await;
            }
            if let Some(watched) = &self.watched_service_accounts {
                watched.add_listener(Arc::new(cache.clone())).await;
            }
        }

        if let Some(watched) = &self.watched_pods {
            watched.start().await.context("启动 Pod 监听失败")?;
        }
        if let Some(watched) = &self.watched_node {
            watched.start().await.context("启动节点监听失败")?;
        }
        if let Some(watched) = &self.watched_service_accounts {
            watched.start().await.context("启动服务账号监听失败")?;
        }

        if let Some(cache) = &self.cache {
            cache.start().await;
        }

        info!(
            node = %self.env.node_name,
            pod_ip = %self.env.pod_ip,
            server_port = self.config.server_port,
            workload_identity_pool = %self.workload_identity_pool,
            cache_tokens = self.cache.is_some(),
            "GKEMD Agent 已启动"
        );
        Ok(())
    }

    /// 停止 Agent
    pub async fn stop(&self) {
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        if let Some(watched) = &self.watched_pods {
            watched.close().await;
        }
        if let Some(watched) = &self.watched_node {
            watched.close().await;
        }
        if let Some(watched) = &self.watched_service_accounts {
            watched.close().await;
        }
        info!("GKEMD Agent 已停止");
    }

    /// 为客户端地址签发访问令牌
    pub async fn token_for_client(&self, ip: IpAddr) -> gkemd_common::Result<Arc<CachedToken>> {
        let sa = self.resolver.resolve(ip).await?;
        self.tokens.get(&sa).await
    }

    /// 解析客户端地址对应的服务账号
    pub async fn service_account_for_client(
        &self,
        ip: IpAddr,
    ) -> gkemd_common::Result<ServiceAccountReference> {
        self.resolver.resolve(ip).await
    }

    /// 当前配置
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 进程环境
    pub fn environment(&self) -> &NodeEnvironment {
        &self.env
    }

    /// workload identity pool 名称
    pub fn workload_identity_pool(&self) -> &str {
        &self.workload_identity_pool
    }

    /// Pod 提供者
    pub fn pods(&self) -> Arc<dyn Provider<Pod>> {
        self.pods.clone()
    }

    /// 节点提供者
    pub fn node(&self) -> Arc<dyn Provider<Node>> {
        self.node.clone()
    }

    /// 服务账号提供者
    pub fn service_accounts(&self) -> Arc<dyn Provider<ServiceAccount>> {
        self.service_accounts.clone()
    }

    /// 令牌提供者
    pub fn tokens(&self) -> Arc<dyn TokenProvider> {
        self.tokens.clone()
    }
}
