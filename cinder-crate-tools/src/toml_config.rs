use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

/// 从 TOML 字符串解析配置
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> anyhow::Result<T> {
    toml::from_str(content).context("无法解析 TOML 配置")
}

/// 从 TOML 文件加载配置
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).with_context(|| format!("无法读取配置文件: {}", path.display()))?;

    toml::from_str(&content).with_context(|| format!("无法解析配置文件: {}", path.display()))
}
