//! 工作负载身份提供方模型
//!
//! 该模块校验 GCP Workload Identity Provider 的完整资源名，格式为：
//! projects/<项目编号>/locations/global/workloadIdentityPools/<池>/providers/<提供方>
//! 并派生出身份池名称和 STS 交换使用的受众（audience）。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

static PROVIDER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^projects/\d+/locations/global/workloadIdentityPools/([^/]+)/providers/[^/]+$")
        .expect("静态正则表达式")
});

/// 工作负载身份提供方
///
/// 启动时构造一次，之后只读，可以在所有并发请求之间安全共享。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkloadIdentityProvider {
    name: String,
    pool: String,
    audience: String,
}

impl WorkloadIdentityProvider {
    /// 校验并解析提供方资源名
    pub fn parse(name: &str) -> Result<Self> {
        let captures = PROVIDER_PATTERN.captures(name).ok_or_else(|| {
            Error::Config(format!(
                "workload identity provider 名称 {:?} 不符合格式 {}",
                name,
                PROVIDER_PATTERN.as_str()
            ))
        })?;

        let pool = captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::Config("无法提取 workload identity pool".to_string()))?;

        Ok(Self {
            name: name.to_string(),
            pool,
            audience: format!("//iam.googleapis.com/{}", name),
        })
    }

    /// 完整资源名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 身份池名称
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// STS 受众
    pub fn audience(&self) -> &str {
        &self.audience
    }
}

impl fmt::Display for WorkloadIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for WorkloadIdentityProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_valid_provider() {
        let name = "projects/123/locations/global/workloadIdentityPools/pool-x/providers/prov-y";
        let provider = WorkloadIdentityProvider::parse(name).unwrap();
        assert_eq!(provider.pool(), "pool-x");
        assert_eq!(provider.name(), name);
        assert_eq!(provider.audience(), format!("//iam.googleapis.com/{}", name));
    }

    #[rstest]
    #[case("projects/abc/locations/global/workloadIdentityPools/pool/providers/p")]
    #[case("projects/123/locations/us-east1/workloadIdentityPools/pool/providers/p")]
    #[case("projects/123/locations/global/workloadIdentityPools//providers/p")]
    #[case("projects/123/locations/global/workloadIdentityPools/pool/providers/")]
    #[case("projects/123/locations/global/workloadIdentityPools/pool/providers/p/extra")]
    #[case("/projects/123/locations/global/workloadIdentityPools/pool/providers/p")]
    #[case("")]
    fn test_invalid_provider(#[case] name: &str) {
        let err = WorkloadIdentityProvider::parse(name).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[rstest]
    #[case("projects/1/locations/global/workloadIdentityPools/a/providers/b", "a")]
    #[case("projects/987654/locations/global/workloadIdentityPools/my.pool_1/providers/gke", "my.pool_1")]
    fn test_pool_extraction(#[case] name: &str, #[case] pool: &str) {
        assert_eq!(name.parse::<WorkloadIdentityProvider>().unwrap().pool(), pool);
    }
}
