//! GKEMD Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 GKEMD 项目中所有组件共享的数据结构和错误处理，
//! 包括服务账号引用、工作负载身份提供方、访问令牌模型以及统一的错误类型。

pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::{Error, IntoError, Result};
pub use models::service_account::*;
pub use models::token::*;
pub use models::workload_identity::*;
