//! 数据模型模块
//!
//! 该模块定义了 GKEMD 项目中使用的核心数据模型，包括服务账号引用、
//! 工作负载身份提供方以及访问令牌。

pub mod service_account;
pub mod token;
pub mod workload_identity;
