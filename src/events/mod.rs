//! 事件模块
//!
//! - `types.rs`: 进度事件与安装事件
//! - `bus.rs`: 有界扇出总线，发布方永不阻塞
//! - `throttle.rs`: 事件节流，控制进度事件的发布频率

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
