//! 网络层
//! 每条连接一个事件循环：先握手认证，之后循环解帧、派发、回 ack。
//! 单连接的字节严格串行处理，帧 k 的 ack 一定在它全部记录派发完成
//! 之后写出，派发期间到达的字节留在缓冲区

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{broadcast, mpsc},
    time,
};

use crate::{
    config::Config,
    protocol::{
        registry::DeviceRegistry,
        tracker::{MovementTracker, TrackerConfig, WalkAction},
    },
    store::{self, with_retry, DeviceRef, NormalizedRecord, Store, WalkHandle},
    Hook,
};

pub(crate) mod conn;
pub(crate) mod packet;

pub(crate) use conn::DeviceConnection;

use self::packet::{AvlDecoder, AvlFrame};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Conn(#[from] conn::Error),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Store error: {0}")]
    Store(#[from] store::Error),
}

/// 会话级配置，从全局配置摘出
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) idle_timeout: Duration,
    pub(crate) rate_limit_frames_per_min: usize,
    pub(crate) strict_crc: bool,
    pub(crate) tracker: TrackerConfig,
}

impl From<&Config> for SessionSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            idle_timeout: cfg.socket_timeout,
            rate_limit_frames_per_min: cfg.rate_limit_frames_per_min,
            strict_crc: cfg.strict_crc,
            tracker: TrackerConfig {
                warmup_ms: cfg.warmup_ms,
                idle_ms: cfg.idle_ms,
                speed_threshold_kmh: cfg.speed_threshold_kmh,
            },
        }
    }
}

/// 单设备帧率限制，滑动窗口
pub(crate) struct RateLimiter {
    max: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            window: Duration::from_secs(60),
            hits: VecDeque::new(),
        }
    }

    /// 窗口内还有配额则放行并记账
    pub(crate) fn admit(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// 一条设备连接的事件循环
pub(crate) struct DeviceEventLoop<T, S, H> {
    conn: DeviceConnection<T>,
    peer: SocketAddr,
    imei: String,
    device: DeviceRef,
    token: u64,
    registry: Arc<DeviceRegistry>,
    store: Arc<S>,
    hook: Arc<H>,
    decoder: AvlDecoder,
    tracker: MovementTracker,
    /// 当前活跃 walk 的句柄，open 成功后持有
    walk: Option<WalkHandle>,
    limiter: RateLimiter,
    settings: SessionSettings,
    close_rx: mpsc::Receiver<()>,
    shutdown: broadcast::Receiver<()>,
}

impl<T, S, H> DeviceEventLoop<T, S, H>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Store,
    H: Hook,
{
    /// 握手：第一帧必须是登录帧
    /// 未知设备不回任何字节直接断开；认证通过先注册再回 0x01
    pub(crate) async fn new(
        stream: T,
        peer: SocketAddr,
        registry: Arc<DeviceRegistry>,
        store: Arc<S>,
        hook: Arc<H>,
        settings: SessionSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, Error> {
        let mut conn = DeviceConnection::new(stream);
        let login = time::timeout(settings.idle_timeout, conn.read_imei())
            .await
            .map_err(conn::Error::Idle)??;

        let device = with_retry("lookup_device", || store.lookup_device(&login.imei))
            .await?
            .ok_or_else(|| Error::UnknownDevice(login.imei.clone()))?;

        let (close_tx, close_rx) = mpsc::channel(1);
        let token = registry.register(&login.imei, peer, close_tx).await;
        conn.write_login_ack().await?;
        hook.authenticated(&login.imei).await;
        debug!("device {} authenticated from {}", login.imei, peer);

        Ok(Self {
            conn,
            peer,
            imei: login.imei,
            device,
            token,
            registry,
            store,
            hook,
            decoder: AvlDecoder::new(settings.strict_crc),
            tracker: MovementTracker::new(settings.tracker),
            walk: None,
            limiter: RateLimiter::new(settings.rate_limit_frames_per_min),
            settings,
            close_rx,
            shutdown,
        })
    }

    pub(crate) fn imei(&self) -> &str {
        &self.imei
    }

    /// 开启事件循环，退出时无论什么原因都先收尾再返回
    pub(crate) async fn start(mut self) -> Result<(), Error> {
        let result = self.run().await;
        self.teardown().await;
        result
    }

    async fn run(&mut self) -> Result<(), Error> {
        loop {
            let frame = select! {
                read = time::timeout(
                    self.settings.idle_timeout,
                    self.conn.read_avl(&mut self.decoder),
                ) => {
                    match read {
                        Ok(Ok(frame)) => frame,
                        // 对端正常断开
                        Ok(Err(conn::Error::ConnectionAborted)) => {
                            debug!("device {} disconnected", self.imei);
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        // 空闲超时，干净收口
                        Err(_) => {
                            debug!("device {} idle timeout, closing", self.imei);
                            return Ok(());
                        }
                    }
                }
                // 被重连会话替换，或优雅停机
                _ = self.close_rx.recv() => {
                    debug!("session of {} asked to close", self.imei);
                    return Ok(());
                }
                _ = self.shutdown.recv() => return Ok(()),
            };
            self.handle_frame(frame).await?;
        }
    }

    async fn handle_frame(&mut self, frame: AvlFrame) -> Result<(), Error> {
        let bytes = self.conn.take_bytes_read();
        self.registry.touch(&self.imei, bytes, 1).await;

        if !self.limiter.admit(Instant::now()) {
            debug!(
                "device {} rate limited, dropping frame of {} records",
                self.imei,
                frame.records.len()
            );
            // 丢帧也要回 ack=0，否则设备会风暴式重传
            return Ok(self.conn.write_record_ack(0).await?);
        }

        for record in &frame.records {
            let normalized = NormalizedRecord::from_avl(record);
            if let Some(action) = self.tracker.update(&normalized) {
                self.apply_walk_action(action).await;
            }

            let store = &self.store;
            let device = &self.device;
            if let Err(e) =
                with_retry("append_record", || store.append_record(device, &normalized))
                    .await
            {
                // 不回 ack，设备会重传整帧；会话继续
                warn!("dropping frame of {}: {}", self.imei, e);
                return Ok(());
            }
        }

        Ok(self
            .conn
            .write_record_ack(frame.records.len() as u32)
            .await?)
    }

    /// 执行状态机给出的 walk 动作
    /// store 失败只记日志，运动状态不回滚，设备数据流不中断
    async fn apply_walk_action(&mut self, action: WalkAction) {
        match action {
            WalkAction::Open { points } => {
                let store = &self.store;
                let device = &self.device;
                match with_retry("open_walk", || store.open_walk(device, &points)).await {
                    Ok(handle) => {
                        debug!("walk {} opened for {}", handle.id, self.imei);
                        self.walk = Some(handle);
                        self.hook.walk_opened(&self.imei, &handle).await;
                    }
                    Err(e) => warn!("open_walk for {} failed: {}", self.imei, e),
                }
            }
            WalkAction::Extend { point } => {
                if let Some(handle) = self.walk {
                    let store = &self.store;
                    if let Err(e) =
                        with_retry("extend_walk", || store.extend_walk(&handle, point)).await
                    {
                        warn!("extend_walk for {} failed: {}", self.imei, e);
                    }
                }
            }
            WalkAction::Close { end_ts } => {
                if let Some(handle) = self.walk.take() {
                    let store = &self.store;
                    match with_retry("close_walk", || store.close_walk(&handle, end_ts)).await
                    {
                        Ok(()) => {
                            debug!("walk {} closed for {}", handle.id, self.imei);
                            self.hook.walk_closed(&self.imei, &handle).await;
                        }
                        Err(e) => warn!("close_walk for {} failed: {}", self.imei, e),
                    }
                }
            }
        }
    }

    /// 会话收尾：Saving 中的 walk 以最后轨迹点收口，注销注册表条目
    /// socket 已经死掉也照常执行
    async fn teardown(&mut self) {
        if let Some(action) = self.tracker.finalize() {
            self.apply_walk_action(action).await;
        }
        self.registry.unregister(&self.imei, self.token).await;
        self.hook.disconnected(&self.imei).await;
        debug!("session of {} from {} finished", self.imei, self.peer);
    }
}
