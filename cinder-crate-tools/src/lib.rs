//! Cinder 工具集
//!
//! 提供日志初始化、TOML 配置加载、性能分析 span 等通用工具。

pub mod init_log;
pub mod profile;
pub mod toml_config;

pub use tracy_client;
