//! 一个 Teltonika AVL 接入服务库，用户可以使用此库构建自己的设备网关
//!
//! 支持 Codec 8 / Codec 8 Extended 两种报文编码，按 IMEI 认证设备，
//! 解析出的定位记录交给 [`store::Store`] 持久化，并在进程内维护
//! 每台设备的运动状态（walk 会话）

use async_trait::async_trait;

use crate::store::WalkHandle;

pub mod config;
pub mod error;
pub mod monitor;
mod network;
pub mod protocol;
pub mod server;
pub mod store;

/// 网关事件发生时的回调，由用户实现
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 设备认证通过，连接进入数据阶段
    async fn authenticated(&self, imei: &str);
    /// 设备连接断开
    async fn disconnected(&self, imei: &str);
    /// 开启一条 walk 会话
    async fn walk_opened(&self, imei: &str, walk: &WalkHandle);
    /// 关闭一条 walk 会话
    async fn walk_closed(&self, imei: &str, walk: &WalkHandle);
}

pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn authenticated(&self, _imei: &str) {}

    async fn disconnected(&self, _imei: &str) {}

    async fn walk_opened(&self, _imei: &str, _walk: &WalkHandle) {}

    async fn walk_closed(&self, _imei: &str, _walk: &WalkHandle) {}
}
