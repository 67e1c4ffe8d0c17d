//! 受监听的资源类型
//!
//! 为 Pod、Node、ServiceAccount 定义查找键和索引规则：
//! Pod 按 IP 地址查找，Node 按名称查找，ServiceAccount 按服务账号引用查找。

use gkemd_common::{Result, ServiceAccountReference};
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use kube::ResourceExt;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;

/// 资源类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// 本节点上的 Pod
    Pod,
    /// 本节点
    Node,
    /// 集群中的服务账号
    ServiceAccount,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Node => write!(f, "node"),
            ResourceKind::ServiceAccount => write!(f, "serviceaccount"),
        }
    }
}

/// 可以被镜像和索引的资源
pub trait WatchedResource: Clone + fmt::Debug + Send + Sync + 'static {
    /// 查找键
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// 资源类型标签
    const KIND: ResourceKind;

    /// 对象在镜像中的唯一标识
    fn object_key(&self) -> String;

    /// 资源版本，用于全量同步时判断对象是否变化
    fn version(&self) -> Option<String>;

    /// 该对象可以通过哪些键查找到
    fn index_keys(&self) -> Vec<Self::Key>;
}

fn namespaced_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

impl WatchedResource for Pod {
    type Key = IpAddr;
    const KIND: ResourceKind = ResourceKind::Pod;

    fn object_key(&self) -> String {
        namespaced_key(self)
    }

    fn version(&self) -> Option<String> {
        self.resource_version()
    }

    /// 主机网络 Pod 与节点共享地址，已结束的 Pod 的地址可能被复用，二者都不建立 IP 索引
    fn index_keys(&self) -> Vec<IpAddr> {
        if is_host_network(self) || is_finished(self) {
            return Vec::new();
        }

        let Some(status) = self.status.as_ref() else {
            return Vec::new();
        };

        let mut ips: HashSet<IpAddr> = status
            .pod_ips
            .iter()
            .flatten()
            .filter_map(|pod_ip| pod_ip.ip.as_deref())
            .filter_map(|ip| ip.parse().ok())
            .collect();
        if let Some(ip) = status.pod_ip.as_deref().and_then(|ip| ip.parse().ok()) {
            ips.insert(ip);
        }

        ips.into_iter().collect()
    }
}

impl WatchedResource for Node {
    type Key = String;
    const KIND: ResourceKind = ResourceKind::Node;

    fn object_key(&self) -> String {
        self.name_any()
    }

    fn version(&self) -> Option<String> {
        self.resource_version()
    }

    fn index_keys(&self) -> Vec<String> {
        vec![self.name_any()]
    }
}

impl WatchedResource for ServiceAccount {
    type Key = ServiceAccountReference;
    const KIND: ResourceKind = ResourceKind::ServiceAccount;

    fn object_key(&self) -> String {
        namespaced_key(self)
    }

    fn version(&self) -> Option<String> {
        self.resource_version()
    }

    fn index_keys(&self) -> Vec<ServiceAccountReference> {
        let namespace = self.namespace().unwrap_or_default();
        ServiceAccountReference::new(self.name_any(), namespace)
            .into_iter()
            .collect()
    }
}

/// Pod 是否运行在主机网络上
pub fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

/// Pod 是否已经结束（Succeeded 或 Failed）
pub fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Pod 使用的服务账号
///
/// 未指定 `serviceAccountName` 时使用命名空间中的 `default`。
pub fn pod_service_account(pod: &Pod) -> Result<ServiceAccountReference> {
    let name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string());
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    ServiceAccountReference::new(name, namespace)
}

#[cfg(test)]
pub(crate) mod testing {
    //! 测试用的资源构造函数

    use k8s_openapi::api::core::v1::{Pod, PodIP, PodSpec, PodStatus, ServiceAccount};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    pub fn pod(namespace: &str, name: &str, ip: &str, service_account: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(service_account.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(ip.to_string()),
                pod_ips: Some(vec![PodIP {
                    ip: Some(ip.to_string()),
                }]),
                ..Default::default()
            }),
        }
    }

    pub fn host_network_pod(namespace: &str, name: &str, node_ip: &str) -> Pod {
        let mut pod = pod(namespace, name, node_ip, "default");
        if let Some(spec) = pod.spec.as_mut() {
            spec.host_network = Some(true);
        }
        pod
    }

    pub fn service_account(
        namespace: &str,
        name: &str,
        version: &str,
        annotations: &[(&str, &str)],
    ) -> ServiceAccount {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(version.to_string()),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
