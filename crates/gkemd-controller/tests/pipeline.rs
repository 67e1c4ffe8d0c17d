//! 节点池服务账号的端到端场景：无法归属到普通 Pod 的请求使用节点池服务账号取得令牌

use async_trait::async_trait;
use gkemd_common::{CachedToken, Error, Result, ServiceAccountReference};
use gkemd_controller::{
    compose, CacheProvider, CacheProviderOptions, PodIdentityResolver, Provider, TokenProvider,
    WatchEvent, WatchSource, WatchedProvider, WatchedProviderOptions,
};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn pod(namespace: &str, name: &str, ip: &str, service_account: &str, host_network: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(service_account.to_string()),
            host_network: Some(host_network),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

/// 一次性列出固定 Pod 集合的数据源
struct FixedPods(Vec<Pod>);

impl WatchSource<Pod> for FixedPods {
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<Pod>>> {
        futures::stream::iter(vec![Ok(WatchEvent::Restarted(self.0.clone()))])
            .chain(futures::stream::pending())
            .boxed()
    }
}

/// 直接查询：按 IP 返回包括主机网络 Pod 在内的所有 Pod
struct DirectPods(HashMap<IpAddr, Arc<Pod>>);

#[async_trait]
impl Provider<Pod> for DirectPods {
    async fn get(&self, ip: &IpAddr) -> Result<Arc<Pod>> {
        self.0
            .get(ip)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {}", ip)))
    }
}

#[derive(Default)]
struct RecordingSource {
    calls: AtomicUsize,
    requested: Mutex<Vec<ServiceAccountReference>>,
}

#[async_trait]
impl TokenProvider for RecordingSource {
    async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<CachedToken>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(sa.clone());
        Ok(Arc::new(CachedToken::expiring_in(
            format!("ya29.{}", sa),
            chrono::Duration::hours(1),
        )))
    }
}

#[tokio::test]
async fn test_node_pool_pipeline() {
    let node_pool = ServiceAccountReference::new("default", "kube-system").unwrap();
    let app = pod("team-a", "api", "10.0.0.7", "api-sa", false);
    let proxy = pod("kube-system", "proxy", "192.168.1.10", "proxy-sa", true);

    let watched = Arc::new(WatchedProvider::new(
        Arc::new(FixedPods(vec![app.clone(), proxy.clone()])),
        WatchedProviderOptions::default(),
    ));
    let direct = Arc::new(DirectPods(HashMap::from([
        ("10.0.0.7".parse().unwrap(), Arc::new(app)),
        ("192.168.1.10".parse().unwrap(), Arc::new(proxy)),
    ])));
    let pods = compose(direct, Some(watched.clone()), false);
    watched.start().await.unwrap();

    let source = Arc::new(RecordingSource::default());
    let mut options = CacheProviderOptions::new(source.clone(), 4);
    options.node_pool_service_account = Some(node_pool.clone());
    let cache = CacheProvider::new(options).unwrap();
    let resolver = PodIdentityResolver::new(pods, Some(node_pool.clone()));

    // 主机网络 Pod 经回退查询找到，但仍使用节点池服务账号
    let sa = resolver.resolve("192.168.1.10".parse().unwrap()).await.unwrap();
    assert_eq!(sa, node_pool);
    let token = cache.get(&sa).await.unwrap();
    assert_eq!(token.access_token(), "ya29.kube-system/default");

    // 未知地址同样使用节点池服务账号，命中缓存
    let sa = resolver.resolve("10.9.9.9".parse().unwrap()).await.unwrap();
    let again = cache.get(&sa).await.unwrap();
    assert!(Arc::ptr_eq(&token, &again));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    // 普通 Pod 使用自己的服务账号
    let sa = resolver.resolve("10.0.0.7".parse().unwrap()).await.unwrap();
    assert_eq!(sa, ServiceAccountReference::new("api-sa", "team-a").unwrap());
    let token = cache.get(&sa).await.unwrap();
    assert_eq!(token.access_token(), "ya29.team-a/api-sa");
    assert_eq!(
        *source.requested.lock().unwrap(),
        vec![node_pool, sa]
    );

    cache.close().await;
    watched.close().await;
}
