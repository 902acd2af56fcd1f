//! tracy 性能分析的薄封装
//!
//! 只有在 tracy client 已经启动时才会产生 span，
//! 未开启 `tracy` feature 或者没有启动 client 时为空操作。

/// 创建一个作用域 span，返回值需要绑定到变量上以延长生命周期
///
/// ```ignore
/// let _span = cinder_crate_tools::profile_span!("CommandQueue::execute");
/// ```
#[macro_export]
macro_rules! profile_span {
    ($name:literal) => {
        $crate::tracy_client::Client::running()
            .map(|client| client.span($crate::tracy_client::span_location!($name), 0))
    };
}
