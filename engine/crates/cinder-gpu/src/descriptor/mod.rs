//! descriptor 管理
//!
//! - [`cpu_allocator`]：CPU 可见（非 shader visible）descriptor 的 best-fit 分配
//! - [`shader_visible_pool`]：shader visible heap 的全局池
//! - [`dynamic_heap`]：录制期间暂存 descriptor，在 draw / dispatch 前复制到 shader visible heap

pub mod cpu_allocator;
pub mod dynamic_heap;
pub mod shader_visible_pool;

pub use cpu_allocator::{CpuDescriptorAllocator, CpuDescriptorAllocatorPage, DescriptorAllocation};
pub use dynamic_heap::DynamicDescriptorHeap;
pub use shader_visible_pool::{ShaderVisibleHeap, ShaderVisibleHeapPool};
