//! 运动状态机
//! 把单台设备的定位记录流折算成 walk 会话：连续运动满 warmup
//! 时长开启，连续静止满 idle 时长关闭。全部以设备时间轴计算，
//! 与服务器时钟无关

use std::mem;

use crate::store::{NormalizedRecord, WalkPoint};

/// 地球平均半径，哈弗辛公式用
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// 连续运动多久后开启 walk（毫秒）
    pub warmup_ms: i64,
    /// 累计静止多久后关闭 walk（毫秒）
    pub idle_ms: i64,
    /// 没有 movement 元素时，超过该速度判为运动
    pub speed_threshold_kmh: u16,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 300_000,
            idle_ms: 300_000,
            speed_threshold_kmh: 3,
        }
    }
}

/// 状态机要求 store 执行的动作
#[derive(Debug, Clone, PartialEq)]
pub enum WalkAction {
    /// 开启 walk，携带 warmup 期间积累的全部轨迹点
    Open { points: Vec<WalkPoint> },
    /// 追加一个轨迹点
    Extend { point: WalkPoint },
    /// 关闭 walk
    Close { end_ts: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WarmingUp,
    Saving,
}

/// 单台设备的运动状态机，由拥有该设备连接的会话独占驱动
#[derive(Debug)]
pub struct MovementTracker {
    cfg: TrackerConfig,
    state: State,
    /// warmup 期间暂存的轨迹点，开启 walk 时整体上交
    pending: Vec<WalkPoint>,
    /// 本轮连续运动的起点时间
    movement_start_ts: i64,
    /// Saving 状态下累计的静止时长
    idle_accum_ms: i64,
    /// 上一条驱动状态机的记录时间
    last_ts: i64,
    /// 已入 walk 的最后一个轨迹点时间，断连收尾用
    last_point_ts: i64,
}

impl MovementTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            state: State::Idle,
            pending: Vec::new(),
            movement_start_ts: 0,
            idle_accum_ms: 0,
            last_ts: 0,
            last_point_ts: 0,
        }
    }

    /// 喂入一条记录，返回需要执行的 walk 动作
    /// 坐标无效的记录不驱动状态机，也永远不会进入任何 walk
    pub fn update(&mut self, record: &NormalizedRecord) -> Option<WalkAction> {
        if !valid_position(record) {
            return None;
        }

        let ts = record.timestamp_ms;
        let moving = self.is_moving(record);
        let point = WalkPoint {
            lat: record.latitude,
            lon: record.longitude,
            ts,
        };

        let action = match self.state {
            State::Idle => {
                if moving {
                    self.movement_start_ts = ts;
                    self.pending.push(point);
                    self.state = State::WarmingUp;
                } else {
                    self.idle_accum_ms = 0;
                }
                None
            }
            State::WarmingUp => {
                if moving {
                    if ts - self.movement_start_ts >= self.cfg.warmup_ms {
                        let points = mem::take(&mut self.pending);
                        self.last_point_ts =
                            points.last().map(|p| p.ts).unwrap_or(ts);
                        self.state = State::Saving;
                        self.idle_accum_ms = 0;
                        Some(WalkAction::Open { points })
                    } else {
                        self.pending.push(point);
                        None
                    }
                } else {
                    self.pending.clear();
                    self.state = State::Idle;
                    None
                }
            }
            State::Saving => {
                if moving {
                    self.idle_accum_ms = 0;
                    self.last_point_ts = ts;
                    Some(WalkAction::Extend { point })
                } else {
                    self.idle_accum_ms += ts - self.last_ts;
                    if self.idle_accum_ms >= self.cfg.idle_ms {
                        self.reset();
                        Some(WalkAction::Close { end_ts: ts })
                    } else {
                        None
                    }
                }
            }
        };

        self.last_ts = ts;
        action
    }

    /// 会话收尾：Saving 状态下以最后一个轨迹点收口，warmup 期间的暂存直接丢弃
    pub fn finalize(&mut self) -> Option<WalkAction> {
        let action = match self.state {
            State::Saving => Some(WalkAction::Close {
                end_ts: self.last_point_ts,
            }),
            _ => None,
        };
        self.reset();
        action
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.pending.clear();
        self.idle_accum_ms = 0;
    }

    fn is_moving(&self, record: &NormalizedRecord) -> bool {
        match record.movement {
            Some(flag) => flag,
            None => record.speed_kmh > self.cfg.speed_threshold_kmh,
        }
    }
}

fn valid_position(record: &NormalizedRecord) -> bool {
    if record.latitude.is_nan() || record.longitude.is_nan() {
        return false;
    }
    record.latitude != 0.0 || record.longitude != 0.0
}

/// 哈弗辛球面距离，单位米
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}
