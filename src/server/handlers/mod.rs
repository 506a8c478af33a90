// API处理器模块

pub mod maintenance;
pub mod upload;

pub use maintenance::*;
pub use upload::*;
