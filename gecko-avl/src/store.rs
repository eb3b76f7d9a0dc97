//! Repository 端口
//! 本层只定义网关对外部存储的最小依赖面和数据契约，
//! 真正的持久化由使用方实现；内存实现用于 demo 和测试

use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use log::warn;
use tokio::{sync::RwLock, time};

use crate::{
    network::packet::{io_element, AvlRecord},
    protocol::tracker::haversine_m,
};

/// 单次 store 调用的封顶时长，超过按瞬时失败处理
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// 瞬时失败的重试次数
const ATTEMPTS: usize = 3;
/// 重试间隔
const BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transient store error: {0}")]
    Transient(String),
    #[error("Fatal store error: {0}")]
    Fatal(String),
}

/// store 里的设备引用，连接认证时换取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub id: i64,
    pub imei: String,
}

/// 一条 walk 的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkHandle {
    pub id: u64,
}

/// walk 轨迹点
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct WalkPoint {
    pub lat: f64,
    pub lon: f64,
    /// Unix 毫秒时间戳
    pub ts: i64,
}

/// extend 之后的最新统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub distance_m: i64,
    pub duration_s: i64,
}

/// 解码后交给存储的记录，线上字段加语义投影
#[derive(Debug, Clone, serde::Serialize)]
pub struct NormalizedRecord {
    pub timestamp_ms: i64,
    pub priority: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: i16,
    pub heading_deg: u16,
    pub satellites: u8,
    pub speed_kmh: u16,
    pub position_valid: bool,
    /// 触发记录的 IO 元素 id，0 为周期上报
    pub event_io_id: u16,
    pub battery_voltage_mv: Option<u16>,
    pub battery_level_pct: Option<u8>,
    pub gnss_on: Option<bool>,
    pub movement: Option<bool>,
    pub charger_connected: Option<bool>,
    pub gsm_signal: Option<u8>,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub man_down: Option<bool>,
    /// (zone 序号, 元素值)，原样上交，不做判定
    pub geofence_zones: Vec<(u8, u8)>,
    /// 没有语义投影的元素原样保留
    pub extra_io: HashMap<u16, u64>,
}

/// 已投影的元素 id，不再进 extra_io
const PROJECTED_IDS: &[u16] = &[21, 67, 69, 113, 116, 181, 182, 240, 242];

impl NormalizedRecord {
    pub(crate) fn from_avl(record: &AvlRecord) -> Self {
        let io = &record.io;
        let geofence_zones = io
            .iter()
            .filter_map(|(id, value)| {
                io_element::geofence_zone(id).map(|zone| (zone, value as u8))
            })
            .collect();
        let extra_io = io
            .iter()
            .filter(|(id, _)| {
                !PROJECTED_IDS.contains(id) && io_element::geofence_zone(*id).is_none()
            })
            .collect();

        Self {
            timestamp_ms: record.timestamp_ms,
            priority: record.priority,
            latitude: record.gps.latitude(),
            longitude: record.gps.longitude(),
            altitude_m: record.gps.altitude_m,
            heading_deg: record.gps.heading_deg,
            satellites: record.gps.satellites,
            speed_kmh: record.gps.speed_kmh,
            position_valid: record.gps.position_valid(),
            event_io_id: io.event_id,
            battery_voltage_mv: io.u16_value(67),
            battery_level_pct: io.u8_value(113),
            gnss_on: io.flag(69),
            movement: io.flag(240),
            charger_connected: io.flag(116),
            gsm_signal: io.u8_value(21),
            pdop: io.u16_value(181).map(|v| v as f64 / 10.0),
            hdop: io.u16_value(182).map(|v| v as f64 / 10.0),
            man_down: io.flag(242),
            geofence_zones,
            extra_io,
        }
    }
}

/// 外部存储的最小接口
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// 按 IMEI 查设备，未知设备返回 None，连接将被拒绝
    async fn lookup_device(&self, imei: &str) -> Result<Option<DeviceRef>, Error>;
    /// 追加一条解码记录
    async fn append_record(
        &self,
        device: &DeviceRef,
        record: &NormalizedRecord,
    ) -> Result<(), Error>;
    /// 开启一条 walk，单设备同时只能有一条活跃 walk，由 store 层保证
    async fn open_walk(
        &self,
        device: &DeviceRef,
        points: &[WalkPoint],
    ) -> Result<WalkHandle, Error>;
    /// 追加轨迹点并重算距离/时长
    async fn extend_walk(
        &self,
        walk: &WalkHandle,
        point: WalkPoint,
    ) -> Result<WalkStats, Error>;
    /// 关闭 walk
    async fn close_walk(&self, walk: &WalkHandle, end_ts: i64) -> Result<(), Error>;
    /// 查设备当前活跃的 walk，进程重启后的恢复入口
    async fn snapshot_active(&self, device: &DeviceRef) -> Result<Option<WalkHandle>, Error>;
}

/// 带超时和有限重试地执行一次 store 调用
/// 运行期的 Fatal 同样按瞬时错误重试，只有启动阶段才终止进程
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        let result = match time::timeout(CALL_TIMEOUT, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!("{what} timed out"))),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= ATTEMPTS {
                    return Err(e);
                }
                warn!("store {} failed (attempt {}): {}", what, attempt, e);
                time::sleep(BACKOFF).await;
            }
        }
    }
}

/// 一条 walk 实体，距离/时长由 store 维护
#[derive(Debug, Clone)]
pub struct WalkPath {
    pub device: i64,
    pub is_active: bool,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
    pub points: Vec<WalkPoint>,
    distance_m: f64,
}

impl WalkPath {
    fn open(device: i64, points: Vec<WalkPoint>) -> Result<Self, Error> {
        let first = points
            .first()
            .ok_or_else(|| Error::Fatal("open walk without points".into()))?;
        let mut walk = Self {
            device,
            is_active: true,
            start_ts: first.ts,
            end_ts: None,
            points: Vec::with_capacity(points.len()),
            distance_m: 0.0,
        };
        for point in points {
            walk.extend(point);
        }
        Ok(walk)
    }

    fn extend(&mut self, point: WalkPoint) {
        if let Some(last) = self.points.last() {
            self.distance_m += haversine_m(last.lat, last.lon, point.lat, point.lon);
        }
        self.points.push(point);
    }

    pub fn stats(&self) -> WalkStats {
        let last_ts = self.points.last().map(|p| p.ts).unwrap_or(self.start_ts);
        WalkStats {
            distance_m: self.distance_m.round() as i64,
            duration_s: (last_ts - self.start_ts) / 1000,
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    /// imei -> 设备 id
    devices: HashMap<String, i64>,
    next_device: i64,
    walks: HashMap<u64, WalkPath>,
    /// 设备 id -> 活跃 walk id
    active: HashMap<i64, u64>,
    next_walk: u64,
    records: Vec<(i64, NormalizedRecord)>,
}

/// 内存 store，demo 和测试用
/// 设备需要先 provision 再连接，和真实存储的行为一致
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一台设备
    pub async fn provision_device(&self, imei: &str) -> DeviceRef {
        let mut inner = self.inner.write().await;
        let id = match inner.devices.get(imei) {
            Some(id) => *id,
            None => {
                inner.next_device += 1;
                let id = inner.next_device;
                inner.devices.insert(imei.into(), id);
                id
            }
        };
        DeviceRef {
            id,
            imei: imei.into(),
        }
    }

    /// 测试/排障用：取一条 walk 的当前状态
    pub async fn walk(&self, handle: &WalkHandle) -> Option<WalkPath> {
        self.inner.read().await.walks.get(&handle.id).cloned()
    }

    /// 测试/排障用：已入库的记录条数
    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lookup_device(&self, imei: &str) -> Result<Option<DeviceRef>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.devices.get(imei).map(|id| DeviceRef {
            id: *id,
            imei: imei.into(),
        }))
    }

    async fn append_record(
        &self,
        device: &DeviceRef,
        record: &NormalizedRecord,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if !inner.devices.contains_key(&device.imei) {
            return Err(Error::Fatal(format!("unknown device {}", device.imei)));
        }
        inner.records.push((device.id, record.clone()));
        Ok(())
    }

    async fn open_walk(
        &self,
        device: &DeviceRef,
        points: &[WalkPoint],
    ) -> Result<WalkHandle, Error> {
        let mut inner = self.inner.write().await;
        if inner.active.contains_key(&device.id) {
            return Err(Error::Fatal(format!(
                "device {} already has an active walk",
                device.imei
            )));
        }
        let walk = WalkPath::open(device.id, points.to_vec())?;
        inner.next_walk += 1;
        let id = inner.next_walk;
        inner.walks.insert(id, walk);
        inner.active.insert(device.id, id);
        Ok(WalkHandle { id })
    }

    async fn extend_walk(
        &self,
        walk: &WalkHandle,
        point: WalkPoint,
    ) -> Result<WalkStats, Error> {
        let mut inner = self.inner.write().await;
        let path = inner
            .walks
            .get_mut(&walk.id)
            .ok_or_else(|| Error::Fatal(format!("unknown walk {}", walk.id)))?;
        if !path.is_active {
            return Err(Error::Fatal(format!("walk {} already closed", walk.id)));
        }
        path.extend(point);
        Ok(path.stats())
    }

    async fn close_walk(&self, walk: &WalkHandle, end_ts: i64) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let path = inner
            .walks
            .get_mut(&walk.id)
            .ok_or_else(|| Error::Fatal(format!("unknown walk {}", walk.id)))?;
        path.is_active = false;
        path.end_ts = Some(end_ts);
        let device = path.device;
        inner.active.remove(&device);
        Ok(())
    }

    async fn snapshot_active(
        &self,
        device: &DeviceRef,
    ) -> Result<Option<WalkHandle>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.active.get(&device.id).map(|id| WalkHandle { id: *id }))
    }
}
