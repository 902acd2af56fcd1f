//! 资源状态到 Vulkan 原生状态的映射
//!
//! 把 [`ResourceStates`] 位掩码展开为 pipeline stage、access mask 和 image layout，
//! 供 Vulkan 风格的 backend 生成 barrier。

use ash::vk;

use crate::{barrier::ResourceBarrier, resource_state::ResourceStates};

/// 资源状态在 Vulkan 中的表示
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VkResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

/// 单个状态位的映射；layout 为 None 表示该状态只对 buffer 有意义
struct StateBitMapping {
    state: ResourceStates,
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: Option<vk::ImageLayout>,
}

const fn stages(a: vk::PipelineStageFlags2, b: vk::PipelineStageFlags2) -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::from_raw(a.as_raw() | b.as_raw())
}

const fn accesses(a: vk::AccessFlags2, b: vk::AccessFlags2) -> vk::AccessFlags2 {
    vk::AccessFlags2::from_raw(a.as_raw() | b.as_raw())
}

const STATE_BIT_MAPPINGS: [StateBitMapping; 14] = [
    StateBitMapping {
        state: ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
        stage: stages(
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            stages(vk::PipelineStageFlags2::PRE_RASTERIZATION_SHADERS, stages(vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::PipelineStageFlags2::COMPUTE_SHADER)),
        ),
        access: accesses(vk::AccessFlags2::VERTEX_ATTRIBUTE_READ, vk::AccessFlags2::UNIFORM_READ),
        layout: None,
    },
    StateBitMapping {
        state: ResourceStates::INDEX_BUFFER,
        stage: vk::PipelineStageFlags2::INDEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
        layout: None,
    },
    StateBitMapping {
        state: ResourceStates::RENDER_TARGET,
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: accesses(vk::AccessFlags2::COLOR_ATTACHMENT_READ, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
        layout: Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::UNORDERED_ACCESS,
        stage: stages(vk::PipelineStageFlags2::COMPUTE_SHADER, vk::PipelineStageFlags2::FRAGMENT_SHADER),
        access: accesses(vk::AccessFlags2::SHADER_STORAGE_READ, vk::AccessFlags2::SHADER_STORAGE_WRITE),
        layout: Some(vk::ImageLayout::GENERAL),
    },
    StateBitMapping {
        state: ResourceStates::DEPTH_WRITE,
        stage: stages(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS),
        access: accesses(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        layout: Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::DEPTH_READ,
        stage: stages(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS),
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        layout: Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::NON_PIXEL_SHADER_RESOURCE,
        stage: stages(vk::PipelineStageFlags2::PRE_RASTERIZATION_SHADERS, vk::PipelineStageFlags2::COMPUTE_SHADER),
        access: accesses(vk::AccessFlags2::SHADER_SAMPLED_READ, vk::AccessFlags2::SHADER_STORAGE_READ),
        layout: Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::PIXEL_SHADER_RESOURCE,
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: accesses(vk::AccessFlags2::SHADER_SAMPLED_READ, vk::AccessFlags2::SHADER_STORAGE_READ),
        layout: Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::STREAM_OUT,
        stage: vk::PipelineStageFlags2::TRANSFORM_FEEDBACK_EXT,
        access: vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT,
        layout: None,
    },
    StateBitMapping {
        state: ResourceStates::INDIRECT_ARGUMENT,
        stage: vk::PipelineStageFlags2::DRAW_INDIRECT,
        access: vk::AccessFlags2::INDIRECT_COMMAND_READ,
        layout: None,
    },
    StateBitMapping {
        state: ResourceStates::COPY_DEST,
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
        layout: Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::COPY_SOURCE,
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
        layout: Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::RESOLVE_DEST,
        stage: vk::PipelineStageFlags2::RESOLVE,
        access: vk::AccessFlags2::TRANSFER_WRITE,
        layout: Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
    },
    StateBitMapping {
        state: ResourceStates::RESOLVE_SOURCE,
        stage: vk::PipelineStageFlags2::RESOLVE,
        access: vk::AccessFlags2::TRANSFER_READ,
        layout: Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
    },
];

impl VkResourceState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }

    /// COMMON / PRESENT 状态：所有阶段都可能访问
    pub const COMMON: Self = Self::new(
        vk::PipelineStageFlags2::ALL_COMMANDS,
        accesses(vk::AccessFlags2::MEMORY_READ, vk::AccessFlags2::MEMORY_WRITE),
        vk::ImageLayout::GENERAL,
    );

    /// 将状态位掩码展开为 Vulkan 状态
    ///
    /// 多个状态位的 layout 不一致时退化为 GENERAL
    pub fn from_states(states: ResourceStates) -> Self {
        if states.is_empty() {
            return Self::COMMON;
        }

        let mut stage = vk::PipelineStageFlags2::NONE;
        let mut access = vk::AccessFlags2::NONE;
        let mut layout: Option<vk::ImageLayout> = None;
        let mut conflicting_layout = false;

        for mapping in STATE_BIT_MAPPINGS.iter().filter(|mapping| states.contains(mapping.state)) {
            stage |= mapping.stage;
            access |= mapping.access;
            match (layout, mapping.layout) {
                (None, new_layout) => layout = new_layout,
                (Some(old), Some(new)) if old != new => conflicting_layout = true,
                _ => {}
            }
        }

        let layout = if conflicting_layout {
            vk::ImageLayout::GENERAL
        } else {
            layout.unwrap_or(vk::ImageLayout::GENERAL)
        };

        Self { stage, access, layout }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.intersects(
            vk::AccessFlags2::SHADER_STORAGE_WRITE
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags2::TRANSFER_WRITE
                | vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT
                | vk::AccessFlags2::MEMORY_WRITE,
        )
    }
}

/// transition barrier 对应的 Vulkan 源/目标状态
pub fn transition_to_vk(barrier: &ResourceBarrier) -> Option<(VkResourceState, VkResourceState)> {
    match barrier {
        ResourceBarrier::Transition { before, after, .. } => {
            Some((VkResourceState::from_states(*before), VkResourceState::from_states(*after)))
        }
        _ => None,
    }
}
