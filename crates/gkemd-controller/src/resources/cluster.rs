//! 基于 Kubernetes API 的数据源
//!
//! 每个数据源既可以作为直接提供者（每次调用都访问 API），
//! 也可以作为监听型提供者的事件来源。

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use gkemd_common::{Error, Result, ServiceAccountReference};
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::{Provider, WatchEvent, WatchSource, WatchedResource};

/// 将 kube 错误映射为统一错误，404 视为资源未找到
pub fn map_kube_error(err: kube::Error, what: impl std::fmt::Display) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("{}: {}", what, resp.message))
        }
        other => Error::Kubernetes(format!("{}: {}", what, other)),
    }
}

/// 把 kube 监听流转换为统一事件流
fn watch_stream<K>(api: Api<K>, config: watcher::Config) -> BoxStream<'static, Result<WatchEvent<K>>>
where
    K: WatchedResource + kube::Resource + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    watcher(api, config)
        .default_backoff()
        .map(|event| match event {
            Ok(watcher::Event::Applied(obj)) => Ok(WatchEvent::Applied(obj)),
            Ok(watcher::Event::Deleted(obj)) => Ok(WatchEvent::Deleted(obj)),
            Ok(watcher::Event::Restarted(objs)) => Ok(WatchEvent::Restarted(objs)),
            Err(e) => Err(Error::Watch(e.to_string())),
        })
        .boxed()
}

/// 本节点上的 Pod
#[derive(Clone)]
pub struct PodSource {
    api: Api<Pod>,
    node_name: String,
}

impl PodSource {
    /// 创建新的 Pod 数据源
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }

    fn node_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }
}

#[async_trait]
impl Provider<Pod> for PodSource {
    async fn get(&self, ip: &IpAddr) -> Result<Arc<Pod>> {
        debug!(ip = %ip, node = %self.node_name, "直接查询 Pod");
        let params = ListParams::default().fields(&self.node_selector());
        let pods = self
            .api
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, format!("列举节点 {} 上的 Pod", self.node_name)))?;

        pods.items
            .into_iter()
            .find(|pod| pod.index_keys().contains(ip))
            .map(Arc::new)
            .ok_or_else(|| Error::NotFound(format!("节点 {} 上没有 IP 为 {} 的 Pod", self.node_name, ip)))
    }
}

impl WatchSource<Pod> for PodSource {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<Pod>>> {
        let config = watcher::Config::default().fields(&self.node_selector());
        watch_stream(self.api.clone(), config)
    }
}

/// 本节点
#[derive(Clone)]
pub struct NodeSource {
    api: Api<Node>,
    node_name: String,
}

impl NodeSource {
    /// 创建新的节点数据源
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl Provider<Node> for NodeSource {
    async fn get(&self, name: &String) -> Result<Arc<Node>> {
        debug!(node = %name, "直接查询节点");
        self.api
            .get(name)
            .await
            .map(Arc::new)
            .map_err(|e| map_kube_error(e, format!("获取节点 {}", name)))
    }
}

impl WatchSource<Node> for NodeSource {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<Node>>> {
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        watch_stream(self.api.clone(), config)
    }
}

/// 集群中的服务账号
#[derive(Clone)]
pub struct ServiceAccountSource {
    client: Client,
}

impl ServiceAccountSource {
    /// 创建新的服务账号数据源
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Provider<ServiceAccount> for ServiceAccountSource {
    async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<ServiceAccount>> {
        debug!(service_account = %sa, "直接查询服务账号");
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), sa.namespace());
        api.get(sa.name())
            .await
            .map(Arc::new)
            .map_err(|e| map_kube_error(e, format!("获取服务账号 {}", sa)))
    }
}

impl WatchSource<ServiceAccount> for ServiceAccountSource {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<ServiceAccount>>> {
        watch_stream(Api::all(self.client.clone()), watcher::Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "serviceaccounts \"ghost\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn test_map_not_found() {
        let err = map_kube_error(api_error(404), "获取服务账号 ns/ghost");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("ns/ghost"));
    }

    #[test]
    fn test_map_other_errors() {
        let err = map_kube_error(api_error(403), "获取服务账号 ns/ghost");
        assert!(matches!(err, Error::Kubernetes(_)));
        assert!(err.is_retryable());
    }
}
