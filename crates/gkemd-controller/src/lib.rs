//! GKEMD 控制核心
//!
//! 该模块实现元数据服务模拟器的凭据签发管线：
//! 维护本节点 Pod、节点对象和集群服务账号的本地镜像，
//! 把请求方 Pod 解析为 Kubernetes 服务账号，通过 Workload Identity Federation
//! 交换 GCP 访问令牌，并在并发限制下缓存和刷新令牌。
//! 使用 kube-rs 框架与 Kubernetes API 交互。

pub mod credentials;
pub mod resources;
pub mod tokens;
pub mod utils;

pub use resources::{
    compose, FallbackProvider, Listener, Provider, ResourceEvent, ResourceKind, WatchEvent,
    WatchSource, WatchedProvider, WatchedProviderOptions, WatchedResource,
};
pub use tokens::{CacheProvider, CacheProviderOptions, CreationProvider, PodIdentityResolver, TokenProvider};
