use std::{env, str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// 网关配置，全部来源于环境变量，未设置的项使用默认值
#[derive(Debug, Clone)]
pub struct Config {
    /// 设备 TCP 监听端口
    pub device_port: u16,
    /// 监控 HTTP 监听端口
    pub monitor_port: u16,
    /// 单连接空闲超时
    pub socket_timeout: Duration,
    /// 并发会话上限，超出的连接直接关闭
    pub max_sessions: usize,
    /// 单设备每分钟帧数上限
    pub rate_limit_frames_per_min: usize,
    /// 连续运动多久后开启 walk（毫秒，设备时间轴）
    pub warmup_ms: i64,
    /// 连续静止多久后关闭 walk（毫秒，设备时间轴）
    pub idle_ms: i64,
    /// 没有 movement IO 元素时，以速度判定运动的阈值
    pub speed_threshold_kmh: u16,
    /// store 地址，内存 store 为 `memory://`
    pub store_uri: String,
    /// 输出 debug 级别日志
    pub debug_log: bool,
    /// CRC 校验失败时拒绝整帧，默认只计数
    pub strict_crc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_port: 5005,
            monitor_port: 5006,
            socket_timeout: Duration::from_millis(300_000),
            max_sessions: 100,
            rate_limit_frames_per_min: 60,
            warmup_ms: 300_000,
            idle_ms: 300_000,
            speed_threshold_kmh: 3,
            store_uri: "memory://".into(),
            debug_log: false,
            strict_crc: false,
        }
    }
}

impl Config {
    /// 从环境变量构造配置，任何一个值解析失败都是致命错误
    pub fn from_env() -> Result<Self, Error> {
        let defaults = Config::default();
        Ok(Self {
            device_port: parsed("DEVICE_PORT", defaults.device_port)?,
            monitor_port: parsed("MONITOR_PORT", defaults.monitor_port)?,
            socket_timeout: Duration::from_millis(parsed(
                "SOCKET_TIMEOUT_MS",
                defaults.socket_timeout.as_millis() as u64,
            )?),
            max_sessions: parsed("MAX_CONCURRENT_SESSIONS", defaults.max_sessions)?,
            rate_limit_frames_per_min: parsed(
                "RATE_LIMIT_FRAMES_PER_MIN",
                defaults.rate_limit_frames_per_min,
            )?,
            warmup_ms: parsed("WARMUP_MS", defaults.warmup_ms)?,
            idle_ms: parsed("IDLE_MS", defaults.idle_ms)?,
            speed_threshold_kmh: parsed("SPEED_THRESHOLD_KMH", defaults.speed_threshold_kmh)?,
            store_uri: env::var("STORE_URI").unwrap_or(defaults.store_uri),
            debug_log: flag("DEBUG_LOG", defaults.debug_log)?,
            strict_crc: flag("STRICT_CRC", defaults.strict_crc)?,
        })
    }
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, Error> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn flag(key: &'static str, default: bool) -> Result<bool, Error> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(Error::Invalid { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_work() {
        let cfg = Config::default();
        assert_eq!(cfg.device_port, 5005);
        assert_eq!(cfg.monitor_port, 5006);
        assert_eq!(cfg.socket_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_sessions, 100);
        assert_eq!(cfg.rate_limit_frames_per_min, 60);
        assert_eq!(cfg.warmup_ms, 300_000);
        assert_eq!(cfg.idle_ms, 300_000);
        assert!(!cfg.strict_crc);
    }

    // 环境变量是进程级状态，覆盖和报错在同一个测试里顺序验证
    #[test]
    fn env_overrides_work() {
        env::set_var("DEVICE_PORT", "7494");
        env::set_var("DEBUG_LOG", "true");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.device_port, 7494);
        assert!(cfg.debug_log);

        env::set_var("DEVICE_PORT", "not-a-port");
        assert!(Config::from_env().is_err());

        env::remove_var("DEVICE_PORT");
        env::remove_var("DEBUG_LOG");
    }
}
