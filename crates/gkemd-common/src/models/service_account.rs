//! Kubernetes 服务账号引用模型
//!
//! 该模块定义了 Kubernetes 服务账号的不可变引用（名称 + 命名空间），
//! 在令牌缓存、资源提供者和事件分发中作为统一的键使用。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, IntoError, Result};

/// 服务账号引用
///
/// 名称与命名空间均不能为空，构造后不可修改。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAccountReference {
    name: String,
    namespace: String,
}

impl ServiceAccountReference {
    /// 创建新的服务账号引用
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let namespace = namespace.into();

        if name.is_empty() {
            return "服务账号名称不能为空".into_error(Error::Config);
        }
        if namespace.is_empty() {
            return "服务账号命名空间不能为空".into_error(Error::Config);
        }

        Ok(Self { name, namespace })
    }

    /// 服务账号名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 服务账号命名空间
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for ServiceAccountReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ServiceAccountReference {
    type Err = Error;

    /// 解析 `namespace/name` 格式
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !name.contains('/') => Self::new(name, namespace),
            _ => Err(Error::Config(format!(
                "无效的服务账号引用 {}，格式应为 namespace/name",
                s
            ))),
        }
    }
}
