//! Cinder GPU 命令与资源编排核心
//!
//! 在 [`cinder_rhi`] 之上提供：
//! - 带队列标签的 fence 与三条硬件队列的提交
//! - command list 的池化复用
//! - 跨 command list / 跨线程的资源状态追踪与 barrier 生成
//! - CPU descriptor 的 best-fit 分配，shader visible heap 的动态暂存
//! - 基于 page 的线性分配器，用于每帧的临时数据
//! - Copy ⊂ Compute ⊂ Graphics 的分层录制上下文
//!
//! 所有子系统由 [`gpu_core::GpuCore`] 组装，并以显式依赖的方式传递。

pub mod command_list;
pub mod command_queue;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod fence;
pub mod gpu_core;
pub mod linear_allocator;
pub mod pipeline;
pub mod resource;
pub mod retire_queue;
pub mod state_tracker;
