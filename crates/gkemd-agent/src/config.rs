//! 配置管理模块
//!
//! 该模块负责加载 Agent 的配置。配置按以下顺序叠加：内置默认值、
//! 可选的 YAML/JSON 配置文件、`GKEMD_` 前缀的环境变量（嵌套字段用 `__` 分隔，
//! 例如 `GKEMD_WATCH_PODS__ENABLED=true`）。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use gkemd_common::{Error, ServiceAccountReference, WorkloadIdentityProvider};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 环境变量前缀
const ENV_PREFIX: &str = "GKEMD";

/// Agent 配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 元数据服务监听端口
    pub server_port: u16,
    /// 日志级别
    pub log_level: String,
    /// workload identity provider 完整资源名
    pub workload_identity_provider: String,
    /// 节点池服务账号（名称和命名空间必须同时指定或同时为空）
    pub node_pool_service_account: NodePoolServiceAccountConfig,
    /// 监听本节点上的 Pod
    pub watch_pods: WatchConfig,
    /// 监听本节点
    pub watch_node: WatchConfig,
    /// 监听集群中的服务账号
    pub watch_service_accounts: WatchConfig,
    /// 令牌缓存
    pub cache_tokens: CacheTokensConfig,
}

/// 节点池服务账号配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolServiceAccountConfig {
    pub name: String,
    pub namespace: String,
}

/// 资源监听配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// 是否启用监听
    pub enabled: bool,
    /// 全量同步周期（秒），为零时只依赖监听
    pub resync_period_secs: u64,
    /// 镜像未命中时是否禁用直接查询回退
    pub disable_fallback: bool,
}

impl WatchConfig {
    fn with_resync(resync_period_secs: u64) -> Self {
        Self {
            enabled: false,
            resync_period_secs,
            disable_fallback: false,
        }
    }

    /// 全量同步周期
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

/// 令牌缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTokensConfig {
    /// 是否启用令牌缓存
    pub enabled: bool,
    /// 同时进行的令牌创建上限
    pub concurrency: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_port: 8080,
            log_level: "info".to_string(),
            workload_identity_provider: String::new(),
            node_pool_service_account: NodePoolServiceAccountConfig::default(),
            watch_pods: WatchConfig::with_resync(600),
            watch_node: WatchConfig::with_resync(3600),
            watch_service_accounts: WatchConfig::with_resync(3600),
            cache_tokens: CacheTokensConfig {
                enabled: false,
                concurrency: 10,
            },
        }
    }
}

impl AgentConfig {
    /// 校验配置，任何错误都是启动时致命的
    pub fn validate(&self) -> gkemd_common::Result<()> {
        WorkloadIdentityProvider::parse(&self.workload_identity_provider)?;
        self.node_pool_service_account()?;
        if self.cache_tokens.concurrency == 0 {
            return Err(Error::Config(
                "cache_tokens.concurrency 必须为正整数".to_string(),
            ));
        }
        Ok(())
    }

    /// 节点池服务账号
    pub fn node_pool_service_account(&self) -> gkemd_common::Result<Option<ServiceAccountReference>> {
        let NodePoolServiceAccountConfig { name, namespace } = &self.node_pool_service_account;
        match (name.is_empty(), namespace.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => ServiceAccountReference::new(name.as_str(), namespace.as_str()).map(Some),
            _ => Err(Error::Config(
                "node_pool_service_account 的 name 和 namespace 必须同时指定或同时为空".to_string(),
            )),
        }
    }

    /// 以 YAML 输出当前配置
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("序列化配置失败")
    }
}

/// 配置管理器
pub struct ConfigManager {
    /// 配置文件路径
    config_path: Option<PathBuf>,
    /// 当前配置
    config: AgentConfig,
}

impl ConfigManager {
    /// 创建新的配置管理器
    ///
    /// 此时日志订阅器还没有安装，加载结果由调用方在安装之后记录。
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config_path = config_path.map(PathBuf::from);

        let config = Self::load_config(config_path.as_deref())
            .context(format!("无法加载配置: {:?}", config_path))?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// 加载配置
    fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
        let defaults = Config::try_from(&AgentConfig::default()).context("构建默认配置失败")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(config_path) = config_path {
            let config_file = config_path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match config_path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("构建配置失败")?;

        let agent_config = config
            .try_deserialize::<AgentConfig>()
            .context("配置格式错误")?;

        Ok(agent_config)
    }

    /// 配置文件路径
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 获取完整配置
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }
}

/// 进程环境
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnvironment {
    /// 所在节点名称
    pub node_name: String,
    /// 本 Pod 的 IPv4 地址
    pub pod_ip: Ipv4Addr,
}

impl NodeEnvironment {
    /// 从 `NODE_NAME` 和 `POD_IP` 环境变量读取
    pub fn from_env() -> gkemd_common::Result<Self> {
        Self::from_vars(std::env::var("NODE_NAME").ok(), std::env::var("POD_IP").ok())
    }

    /// 校验给定的变量值
    pub fn from_vars(node_name: Option<String>, pod_ip: Option<String>) -> gkemd_common::Result<Self> {
        let node_name = node_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Config("必须设置 NODE_NAME 环境变量".to_string()))?;

        let pod_ip = pod_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::Config("必须设置 POD_IP 环境变量".to_string()))?;
        let pod_ip = match pod_ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => ip,
            Ok(IpAddr::V6(_)) => {
                return Err(Error::Config("POD_IP 必须是 IPv4 地址".to_string()));
            }
            Err(e) => {
                return Err(Error::Config(format!("无法解析 POD_IP {:?}: {}", pod_ip, e)));
            }
        };

        Ok(Self { node_name, pod_ip })
    }
}
