//! 断点续传持久化
//!
//! ```text
//! resume/
//! ├── {task_id}.resume     # 续传记录（JSON），校验成功或取消后删除
//! └── {install_id}.install # 安装批次记录（JSON），批次结束后删除
//! ```
//!
//! 同一个任务只有其控制器会写入自己的续传记录；
//! 批次记录由同批次的多个任务共同更新，更新在存储内串行

pub mod store;
pub mod types;

pub use store::ResumeStore;
pub use types::{InstallPackRecord, InstallRecord, ResumeState, SegmentRecord};
