//! 令牌创建提供者
//!
//! 为服务账号签发受众为 workload identity provider 的 Kubernetes 令牌，
//! 写入私有临时文件后交给凭据交换配置换取 GCP 访问令牌。调用之间不保留任何状态。

use async_trait::async_trait;
use gkemd_common::{CachedToken, Error, Result, ServiceAccountReference};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{Api, Client};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::TokenProvider;
use crate::credentials::Config;
use crate::resources::cluster::map_kube_error;
use crate::resources::Provider;
use crate::utils::with_deadline;

/// 指定模拟目标 GCP 服务账号的注解
pub const GCP_SERVICE_ACCOUNT_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

/// Kubernetes 身份令牌默认有效期
const DEFAULT_EXPIRATION_SECONDS: i64 = 3600;

/// 签发身份令牌的截止时间
const ISSUE_DEADLINE: Duration = Duration::from_secs(30);

/// 服务账号注解中的 GCP 服务账号邮箱
pub fn gcp_service_account(sa: &ServiceAccount) -> Option<String> {
    sa.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(GCP_SERVICE_ACCOUNT_ANNOTATION))
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
}

/// Kubernetes 身份令牌签发者
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityTokenIssuer: Send + Sync {
    /// 为服务账号签发指定受众的令牌
    async fn issue(&self, sa: &ServiceAccountReference, audience: &str) -> Result<String>;
}

/// 通过 TokenRequest API 签发令牌
#[derive(Clone)]
pub struct KubeTokenIssuer {
    client: Client,
    expiration_seconds: i64,
}

impl KubeTokenIssuer {
    /// 创建新的签发者
    pub fn new(client: Client) -> Self {
        Self {
            client,
            expiration_seconds: DEFAULT_EXPIRATION_SECONDS,
        }
    }
}

#[async_trait]
impl IdentityTokenIssuer for KubeTokenIssuer {
    async fn issue(&self, sa: &ServiceAccountReference, audience: &str) -> Result<String> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), sa.namespace());
        let request = TokenRequest {
            metadata: Default::default(),
            spec: TokenRequestSpec {
                audiences: vec![audience.to_string()],
                expiration_seconds: Some(self.expiration_seconds),
                bound_object_ref: None,
            },
            status: None,
        };

        let response = api
            .create_token_request(sa.name(), &Default::default(), &request)
            .await
            .map_err(|e| map_kube_error(e, format!("为服务账号 {} 签发令牌", sa)))?;

        let token = response
            .status
            .ok_or_else(|| Error::Kubernetes(format!("服务账号 {} 的令牌响应缺少 status", sa)))?
            .token;
        if token.is_empty() {
            return Err(Error::Kubernetes(format!("服务账号 {} 的令牌为空", sa)));
        }
        Ok(token)
    }
}

/// 令牌创建提供者
pub struct CreationProvider {
    credentials: Arc<Config>,
    issuer: Arc<dyn IdentityTokenIssuer>,
    service_accounts: Arc<dyn Provider<ServiceAccount>>,
}

impl CreationProvider {
    /// 创建新的令牌创建提供者
    pub fn new(
        credentials: Arc<Config>,
        issuer: Arc<dyn IdentityTokenIssuer>,
        service_accounts: Arc<dyn Provider<ServiceAccount>>,
    ) -> Self {
        Self {
            credentials,
            issuer,
            service_accounts,
        }
    }

    /// 完成一次完整的令牌交换
    pub async fn create(&self, sa: &ServiceAccountReference) -> Result<CachedToken> {
        let account = self.service_accounts.get(sa).await?;
        let email = gcp_service_account(&account);
        debug!(service_account = %sa, impersonate = ?email, "开始创建令牌");

        let identity_token = with_deadline(
            ISSUE_DEADLINE,
            self.issuer.issue(sa, self.credentials.audience()),
        )
        .await?;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(identity_token.as_bytes())?;
        file.flush()?;

        let credentials = self.credentials.get(file.path(), email.as_deref())?;
        let token = credentials.token().await?;

        info!(
            service_account = %sa,
            expires_at = %token.expires_at(),
            "令牌创建完成"
        );
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for CreationProvider {
    async fn get(&self, sa: &ServiceAccountReference) -> Result<Arc<CachedToken>> {
        self.create(sa).await.map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ConfigOptions;
    use crate::resources::fallback::testing::StaticProvider;
    use crate::resources::kind::testing::service_account;

    fn credentials() -> Arc<Config> {
        Arc::new(
            Config::new(ConfigOptions {
                workload_identity_provider:
                    "projects/1/locations/global/workloadIdentityPools/pool/providers/prov"
                        .to_string(),
            })
            .unwrap()
            .0,
        )
    }

    fn sa_ref(namespace: &str, name: &str) -> ServiceAccountReference {
        ServiceAccountReference::new(name, namespace).unwrap()
    }

    #[test]
    fn test_gcp_service_account_annotation() {
        let sa = service_account(
            "team-a",
            "builder",
            "1",
            &[(GCP_SERVICE_ACCOUNT_ANNOTATION, "builder@proj.iam.gserviceaccount.com")],
        );
        assert_eq!(
            gcp_service_account(&sa).as_deref(),
            Some("builder@proj.iam.gserviceaccount.com")
        );

        let plain = service_account("team-a", "plain", "1", &[]);
        assert_eq!(gcp_service_account(&plain), None);

        let blank = service_account("team-a", "blank", "1", &[(GCP_SERVICE_ACCOUNT_ANNOTATION, " ")]);
        assert_eq!(gcp_service_account(&blank), None);
    }

    #[tokio::test]
    async fn test_missing_service_account_skips_issuer() {
        let mut issuer = MockIdentityTokenIssuer::new();
        issuer.expect_issue().never();

        let provider = CreationProvider::new(
            credentials(),
            Arc::new(issuer),
            Arc::new(StaticProvider::<ServiceAccount>::new()),
        );
        let err = provider.create(&sa_ref("team-a", "ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_issuer_error_propagates() {
        let accounts = StaticProvider::<ServiceAccount>::new();
        accounts.insert(service_account("team-a", "builder", "1", &[]));

        let mut issuer = MockIdentityTokenIssuer::new();
        issuer
            .expect_issue()
            .withf(|sa, audience| {
                sa.name() == "builder"
                    && audience
                        == "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/pool/providers/prov"
            })
            .times(1)
            .returning(|_, _| Err(Error::Kubernetes("forbidden".to_string())));

        let provider = CreationProvider::new(credentials(), Arc::new(issuer), Arc::new(accounts));
        let err = provider.get(&sa_ref("team-a", "builder")).await.unwrap_err();
        assert!(matches!(err, Error::Kubernetes(_)));
    }
}
