use crate::resource::Format;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// 着色器编译不在本层处理，这里只保留创建 PSO 所需的描述信息
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineStateDesc {
    pub name: String,
    pub kind: PipelineKind,
    pub render_target_formats: Vec<Format>,
    pub depth_format: Option<Format>,
}

impl PipelineStateDesc {
    pub fn compute(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Compute,
            render_target_formats: Vec::new(),
            depth_format: None,
        }
    }

    pub fn graphics(name: impl Into<String>, render_target_formats: Vec<Format>, depth_format: Option<Format>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Graphics,
            render_target_formats,
            depth_format,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    #[inline]
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
    pub format: IndexFormat,
}
