//! 凭据交换配置
//!
//! 根据校验过的 workload identity provider 构造 external account 凭据描述，
//! 交给 `google-cloud-auth` 把本地签发的 Kubernetes 身份令牌交换为 GCP 访问令牌。

mod external_account;

pub use external_account::ExternalAccountCredentials;

use gkemd_common::{Result, WorkloadIdentityProvider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// 凭据类型
pub const EXTERNAL_ACCOUNT_TYPE: &str = "external_account";
/// 主体令牌类型
pub const SUBJECT_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
/// STS 令牌交换端点
pub const STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
/// STS 令牌内省端点
pub const STS_INTROSPECT_URL: &str = "https://sts.googleapis.com/v1/introspect";
/// 默认的全域域名
pub const UNIVERSE_DOMAIN: &str = "googleapis.com";

/// 令牌的访问范围
pub fn access_scopes() -> &'static [&'static str] {
    &[
        "https://www.googleapis.com/auth/cloud-platform",
        "https://www.googleapis.com/auth/userinfo.email",
    ]
}

/// 服务账号模拟端点
pub fn impersonation_url(email: &str) -> String {
    format!(
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
        email
    )
}

/// 凭据交换配置选项
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// workload identity provider 完整资源名
    pub workload_identity_provider: String,
}

/// external account 凭据描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccountDescriptor {
    #[serde(rename = "type")]
    pub credential_type: String,
    pub universe_domain: String,
    pub audience: String,
    pub subject_token_type: String,
    pub token_url: String,
    pub credential_source: CredentialSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_impersonation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_info_url: Option<String>,
}

/// 主体令牌来源，文件内容按纯文本读取
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSource {
    pub file: String,
}

/// 凭据交换配置
///
/// 启动时构造一次，之后只读。
#[derive(Debug, Clone)]
pub struct Config {
    provider: WorkloadIdentityProvider,
}

impl Config {
    /// 校验提供方名称并返回配置及身份池名称
    pub fn new(opts: ConfigOptions) -> Result<(Self, String)> {
        let provider = WorkloadIdentityProvider::parse(&opts.workload_identity_provider)?;
        let pool = provider.pool().to_string();
        Ok((Self { provider }, pool))
    }

    /// 工作负载身份提供方
    pub fn provider(&self) -> &WorkloadIdentityProvider {
        &self.provider
    }

    /// STS 受众，`//iam.googleapis.com/<提供方名称>`
    pub fn audience(&self) -> &str {
        self.provider.audience()
    }

    /// 构造凭据描述
    ///
    /// 指定了模拟目标时使用服务账号模拟端点，否则使用令牌内省端点。
    pub fn descriptor(
        &self,
        cred_file: &Path,
        impersonated_email: Option<&str>,
    ) -> ExternalAccountDescriptor {
        let (service_account_impersonation_url, token_info_url) = match impersonated_email {
            Some(email) => (Some(impersonation_url(email)), None),
            None => (None, Some(STS_INTROSPECT_URL.to_string())),
        };

        ExternalAccountDescriptor {
            credential_type: EXTERNAL_ACCOUNT_TYPE.to_string(),
            universe_domain: UNIVERSE_DOMAIN.to_string(),
            audience: self.audience().to_string(),
            subject_token_type: SUBJECT_TOKEN_TYPE_JWT.to_string(),
            token_url: STS_TOKEN_URL.to_string(),
            credential_source: CredentialSource {
                file: cred_file.to_string_lossy().into_owned(),
            },
            service_account_impersonation_url,
            token_info_url,
        }
    }

    /// 生成可以签发访问令牌的凭据
    pub fn get(
        &self,
        cred_file: &Path,
        impersonated_email: Option<&str>,
    ) -> Result<ExternalAccountCredentials> {
        let descriptor = self.descriptor(cred_file, impersonated_email);
        debug!(
            audience = %descriptor.audience,
            impersonated = impersonated_email.is_some(),
            "构造 external account 凭据"
        );

        ExternalAccountCredentials::from_descriptor(descriptor, access_scopes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gkemd_common::Error;
    use rstest::rstest;

    const PROVIDER: &str =
        "projects/123456/locations/global/workloadIdentityPools/my-pool/providers/my-provider";

    fn config() -> Config {
        Config::new(ConfigOptions {
            workload_identity_provider: PROVIDER.to_string(),
        })
        .unwrap()
        .0
    }

    #[test]
    fn test_new_returns_pool() {
        let (config, pool) = Config::new(ConfigOptions {
            workload_identity_provider: PROVIDER.to_string(),
        })
        .unwrap();
        assert_eq!(pool, "my-pool");
        assert_eq!(config.audience(), format!("//iam.googleapis.com/{}", PROVIDER));
    }

    #[rstest]
    #[case("")]
    #[case("projects/abc/locations/global/workloadIdentityPools/p/providers/x")]
    #[case("projects/1/locations/us-east1/workloadIdentityPools/p/providers/x")]
    #[case("projects/1/locations/global/workloadIdentityPools/p/providers/x/extra")]
    fn test_new_rejects_invalid(#[case] name: &str) {
        let err = Config::new(ConfigOptions {
            workload_identity_provider: name.to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_descriptor_with_impersonation() {
        let descriptor = config().descriptor(
            Path::new("/tmp/token"),
            Some("builder@proj.iam.gserviceaccount.com"),
        );
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["type"], "external_account");
        assert_eq!(json["universe_domain"], "googleapis.com");
        assert_eq!(json["subject_token_type"], SUBJECT_TOKEN_TYPE_JWT);
        assert_eq!(json["token_url"], STS_TOKEN_URL);
        assert_eq!(json["credential_source"]["file"], "/tmp/token");
        assert!(json["credential_source"].get("format").is_none());
        assert_eq!(
            json["service_account_impersonation_url"],
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/builder@proj.iam.gserviceaccount.com:generateAccessToken"
        );
        assert!(json.get("token_info_url").is_none());
    }

    #[test]
    fn test_descriptor_without_impersonation() {
        let descriptor = config().descriptor(Path::new("/tmp/token"), None);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["token_info_url"], STS_INTROSPECT_URL);
        assert!(json.get("service_account_impersonation_url").is_none());
    }

    #[tokio::test]
    async fn test_get_builds_credentials() {
        let credentials = config().get(Path::new("/tmp/token"), None).unwrap();
        assert_eq!(credentials.descriptor().audience, config().audience());
        assert_eq!(credentials.scopes(), access_scopes());
    }
}
