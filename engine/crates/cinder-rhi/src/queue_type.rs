use std::fmt;

/// 硬件队列类型
///
/// 能力是嵌套的：Graphics ⊃ Compute ⊃ Copy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics = 0,
    Compute = 1,
    Copy = 2,
}

impl QueueType {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueType; Self::COUNT] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// 当前队列是否能够执行 `required` 类型的命令
    #[inline]
    pub fn supports(self, required: QueueType) -> bool {
        self.index() <= required.index()
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
