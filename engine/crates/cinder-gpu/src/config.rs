use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 编排核心的容量配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuCoreConfig {
    /// 每个 CPU descriptor page 的 descriptor 数量
    pub descriptors_per_cpu_page: u32,
    /// 每个 shader visible CBV/SRV/UAV heap 的 descriptor 数量
    pub descriptors_per_shader_visible_heap: u32,
    /// 每个 shader visible sampler heap 的 descriptor 数量
    pub samplers_per_shader_visible_heap: u32,
    /// GPU 独占线性分配器的 page 大小
    pub gpu_linear_page_size: u64,
    /// CPU 可写线性分配器的 page 大小
    pub cpu_linear_page_size: u64,
    /// 线性分配的默认对齐，和常量缓冲的对齐要求一致
    pub default_linear_alignment: u64,
}

impl Default for GpuCoreConfig {
    fn default() -> Self {
        Self {
            descriptors_per_cpu_page: 256,
            descriptors_per_shader_visible_heap: 1024,
            samplers_per_shader_visible_heap: 256,
            gpu_linear_page_size: 64 * 1024,
            cpu_linear_page_size: 2 * 1024 * 1024,
            default_linear_alignment: 256,
        }
    }
}

impl GpuCoreConfig {
    /// 从 TOML 字符串加载，缺省字段使用默认值
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = cinder_crate_tools::toml_config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Self = cinder_crate_tools::toml_config::load_toml(path)?;
        config.validate().with_context(|| format!("配置文件无效: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.descriptors_per_cpu_page > 0, "descriptors_per_cpu_page 不能为 0");
        anyhow::ensure!(self.descriptors_per_shader_visible_heap > 0, "descriptors_per_shader_visible_heap 不能为 0");
        anyhow::ensure!(self.samplers_per_shader_visible_heap > 0, "samplers_per_shader_visible_heap 不能为 0");
        anyhow::ensure!(self.gpu_linear_page_size > 0, "gpu_linear_page_size 不能为 0");
        anyhow::ensure!(self.cpu_linear_page_size > 0, "cpu_linear_page_size 不能为 0");
        anyhow::ensure!(
            self.default_linear_alignment.is_power_of_two(),
            "default_linear_alignment 必须是 2 的幂: {}",
            self.default_linear_alignment
        );
        Ok(())
    }
}
