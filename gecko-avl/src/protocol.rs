//! 协议层
//! 认证之后的设备状态：进程级注册表和每台设备的运动状态机

pub mod registry;
pub mod tracker;
