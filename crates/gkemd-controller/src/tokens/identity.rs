//! Pod 身份解析
//!
//! 客户端 IP -> Pod -> Kubernetes 服务账号。无法解析到普通 Pod 时
//! （未找到或主机网络 Pod），配置了节点池服务账号则使用它。

use gkemd_common::{Error, Result, ServiceAccountReference};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::resources::kind::{is_host_network, pod_service_account};
use crate::resources::Provider;

/// Pod 身份解析器
pub struct PodIdentityResolver {
    pods: Arc<dyn Provider<Pod>>,
    node_pool: Option<ServiceAccountReference>,
}

impl PodIdentityResolver {
    /// 创建新的解析器
    pub fn new(pods: Arc<dyn Provider<Pod>>, node_pool: Option<ServiceAccountReference>) -> Self {
        Self { pods, node_pool }
    }

    /// 节点池服务账号
    pub fn node_pool(&self) -> Option<&ServiceAccountReference> {
        self.node_pool.as_ref()
    }

    /// 解析客户端 IP 对应的服务账号
    pub async fn resolve(&self, ip: IpAddr) -> Result<ServiceAccountReference> {
        match self.pods.get(&ip).await {
            Ok(pod) if !is_host_network(&pod) => pod_service_account(&pod),
            Ok(pod) => {
                debug!(ip = %ip, pod = %pod.name_any(), "主机网络 Pod，使用节点池服务账号");
                self.node_pool_or(|| Error::NotFound(format!("主机网络 Pod {} 没有可用的服务账号", ip)))
            }
            Err(e) if e.is_not_found() => {
                debug!(ip = %ip, "未找到 Pod，使用节点池服务账号");
                self.node_pool_or(|| e)
            }
            Err(e) => Err(e),
        }
    }

    fn node_pool_or(&self, err: impl FnOnce() -> Error) -> Result<ServiceAccountReference> {
        self.node_pool.clone().ok_or_else(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::fallback::testing::StaticProvider;
    use crate::resources::kind::testing::{host_network_pod, pod};

    fn node_pool() -> ServiceAccountReference {
        ServiceAccountReference::new("default", "kube-system").unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_pod() {
        let pods = StaticProvider::<Pod>::new();
        pods.insert(pod("team-a", "api", "10.0.0.7", "api-sa"));
        let resolver = PodIdentityResolver::new(Arc::new(pods), Some(node_pool()));

        let sa = resolver.resolve(ip("10.0.0.7")).await.unwrap();
        assert_eq!(sa, ServiceAccountReference::new("api-sa", "team-a").unwrap());
    }

    #[tokio::test]
    async fn test_unknown_ip_uses_node_pool() {
        let resolver =
            PodIdentityResolver::new(Arc::new(StaticProvider::<Pod>::new()), Some(node_pool()));
        assert_eq!(resolver.resolve(ip("192.168.1.10")).await.unwrap(), node_pool());

        let resolver = PodIdentityResolver::new(Arc::new(StaticProvider::<Pod>::new()), None);
        assert!(resolver.resolve(ip("192.168.1.10")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_host_network_pod_never_gets_own_identity() {
        // 直接查询提供者会按 IP 返回主机网络 Pod
        let pods = StaticProvider::<Pod>::new();
        pods.insert_as(
            ip("192.168.1.10"),
            host_network_pod("kube-system", "proxy", "192.168.1.10"),
        );

        let resolver = PodIdentityResolver::new(Arc::new(pods), Some(node_pool()));
        assert_eq!(resolver.resolve(ip("192.168.1.10")).await.unwrap(), node_pool());
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let pods = StaticProvider::<Pod>::new();
        pods.fail_with(Error::Kubernetes("超时".to_string()));
        let resolver = PodIdentityResolver::new(Arc::new(pods), Some(node_pool()));
        assert!(matches!(
            resolver.resolve(ip("10.0.0.7")).await.unwrap_err(),
            Error::Kubernetes(_)
        ));
    }
}
