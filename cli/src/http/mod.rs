//! HTTP服务器模块 - 为看板提供任务、图片与事件流 API

pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod state;
pub mod validation;

pub use models::*;
pub use server::*;
pub use state::*;
