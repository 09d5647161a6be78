//! 数据模型模块

pub mod message;
pub mod push_token;
pub mod retry;

pub use message::*;
pub use push_token::*;
pub use retry::*;
