//! Cinder 平台层
//!
//! 对原生图形 API 的最小抽象：queue / command list / descriptor heap / resource
//! 等对象的创建与命令录制。上层的编排逻辑（fence、状态追踪、描述符分配等）
//! 都只通过 [`device::RenderDevice`] 这一组 trait 访问底层。
//!
//! [`headless`] 提供一个不依赖 GPU 的确定性实现，用于测试。

pub mod barrier;
pub mod descriptor;
pub mod device;
pub mod headless;
pub mod pipeline;
pub mod queue_type;
pub mod resource;
pub mod resource_state;
pub mod root_signature;
pub mod vk_mapping;
