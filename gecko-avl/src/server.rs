//! 设备监听与进程督导
//! 接收连接、套并发上限、为每条连接起一个会话任务；
//! 停机时先停止接收，通知所有会话收尾，限时等待后退出

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{FutureExt, TryFutureExt};
use log::{debug, error, info};
use tokio::{
    net::TcpListener,
    select, signal,
    sync::{broadcast, Semaphore},
    time,
};

use crate::{
    config::Config,
    monitor::{self, MonitorState},
    network::{DeviceEventLoop, SessionSettings},
    protocol::registry::DeviceRegistry,
    store::Store,
    Hook, HookNoop,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] std::io::Error),
    #[error("Monitor error: {0}")]
    Monitor(#[from] monitor::Error),
}

/// 停机时等待会话收尾的时长预算
const DRAIN_BUDGET: Duration = Duration::from_secs(3);

/// 代表一个网关进程
pub struct Server {
    cfg: Config,
}

impl Server {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub async fn start<S: Store>(self, store: Arc<S>) -> Result<(), Error> {
        self.start_with_hook(store, Arc::new(HookNoop)).await
    }

    pub async fn start_with_hook<S: Store, H: Hook>(
        self,
        store: Arc<S>,
        hook: Arc<H>,
    ) -> Result<(), Error> {
        let registry = Arc::new(DeviceRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(16);

        // 监控服务后台任务
        debug!("start monitor loop");
        let monitor_addr: SocketAddr = ([0, 0, 0, 0], self.cfg.monitor_port).into();
        let state = MonitorState {
            registry: registry.clone(),
            started: Instant::now(),
            device_port: self.cfg.device_port,
            monitor_port: self.cfg.monitor_port,
        };
        let (monitor_task, monitor_handle) =
            monitor::serve(monitor_addr, state, shutdown_tx.subscribe())
                .map_err(Error::Monitor)
                .remote_handle();
        tokio::spawn(monitor_task);

        // ctrl-c 触发优雅停机
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = signal_tx.send(());
            }
        });

        // 设备监听循环
        debug!("start device listener loop");
        let (device_task, device_handle) = self
            .serve_devices(registry, store, hook, shutdown_tx)
            .remote_handle();
        tokio::spawn(device_task);

        tokio::try_join!(monitor_handle, device_handle)?;
        Ok(())
    }

    async fn serve_devices<S: Store, H: Hook>(
        self,
        registry: Arc<DeviceRegistry>,
        store: Arc<S>,
        hook: Arc<H>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<(), Error> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.cfg.device_port).into();
        let listener = TcpListener::bind(addr).await?;
        info!("device server listening on {}", addr);

        let settings = SessionSettings::from(&self.cfg);
        let max_sessions = self.cfg.max_sessions;
        let sessions = Arc::new(Semaphore::new(max_sessions));
        let mut shutdown_rx = shutdown_tx.subscribe();

        loop {
            let (stream, peer) = select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept tcp stream err: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };
            debug!("new stream coming in: {}", peer);

            // 并发上限：拿不到名额的连接不写任何数据直接关闭
            let permit = match sessions.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("session limit reached, dropping {}", peer);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay on {} failed: {}", peer, e);
            }

            let session_registry = registry.clone();
            let session_store = store.clone();
            let session_hook = hook.clone();
            let session_settings = settings.clone();
            let session_shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _permit = permit;
                match DeviceEventLoop::new(
                    stream,
                    peer,
                    session_registry,
                    session_store,
                    session_hook,
                    session_settings,
                    session_shutdown,
                )
                .await
                {
                    Ok(event_loop) => {
                        let imei = event_loop.imei().to_owned();
                        if let Err(e) = event_loop.start().await {
                            error!("session of {} exit error: {:#}", imei, e);
                        }
                    }
                    // 握手失败：协议不对或设备未知，静默断开
                    Err(e) => debug!("handshake from {} rejected: {:#}", peer, e),
                }
            });
        }

        // 停止接收之后通知所有会话，限时等待收尾
        registry.close_all().await;
        let deadline = time::Instant::now() + DRAIN_BUDGET;
        while sessions.available_permits() < max_sessions {
            if time::Instant::now() >= deadline {
                info!(
                    "drain budget exhausted, {} sessions still live",
                    max_sessions - sessions.available_permits()
                );
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        info!("device server stopped");
        Ok(())
    }
}
