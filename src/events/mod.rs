//! 事件模块
//!
//! 定义队列事件类型和相关工具
//! - `types.rs`: 上传队列的生命周期事件（单一带标签通道）
//! - `throttle.rs`: 进度事件节流工具

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
