//! 监控 HTTP 服务
//! 只读投影注册表状态，没有任何修改入口

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use log::info;
use serde::Serialize;
use tokio::{net::TcpListener, sync::broadcast};

use crate::protocol::registry::{now_ms, ActiveDeviceView, DeviceRegistry};

/// 静默超过这个时长的设备在 /connections 里列为异常
const STALE_AFTER_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] std::io::Error),
}

pub(crate) struct MonitorState {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) started: Instant,
    pub(crate) device_port: u16,
    pub(crate) monitor_port: u16,
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: MonitorState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Error> {
    let app = router(Arc::new(state));
    let listener = TcpListener::bind(addr).await?;
    info!("monitor listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

fn router(state: Arc<MonitorState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/devices", get(devices))
        .route("/connections", get(connections))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    uptime_sec: u64,
    device_port: u16,
    monitor_port: u16,
}

async fn healthz(State(state): State<Arc<MonitorState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_sec: state.started.elapsed().as_secs(),
        device_port: state.device_port,
        monitor_port: state.monitor_port,
    })
}

#[derive(Debug, Serialize)]
struct Devices {
    devices: Vec<ActiveDeviceView>,
}

async fn devices(State(state): State<Arc<MonitorState>>) -> Json<Devices> {
    Json(Devices {
        devices: state.registry.snapshot().await,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Connections {
    active_connections: usize,
    issues: Vec<String>,
}

async fn connections(State(state): State<Arc<MonitorState>>) -> Json<Connections> {
    let snapshot = state.registry.snapshot().await;
    Json(Connections {
        active_connections: snapshot.len(),
        issues: stale_devices(&snapshot, now_ms()),
    })
}

/// 太久没有活动的设备
fn stale_devices(snapshot: &[ActiveDeviceView], now: u64) -> Vec<String> {
    snapshot
        .iter()
        .filter(|d| now.saturating_sub(d.last_activity_at) > STALE_AFTER_MS)
        .map(|d| d.device_id.clone())
        .collect()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(device_id: &str, last_activity_at: u64) -> ActiveDeviceView {
        ActiveDeviceView {
            device_id: device_id.into(),
            connected_at: 0,
            last_activity_at,
            bytes_received: 0,
            packets_processed: 0,
        }
    }

    #[test]
    fn stale_devices_works() {
        let snapshot = vec![
            view("111111111111111", 100_000),
            view("222222222222222", 65_000),
        ];
        // 30 秒整不算异常，超过才算
        assert!(stale_devices(&snapshot, 95_000).is_empty());
        assert_eq!(
            stale_devices(&snapshot, 95_001),
            vec!["222222222222222".to_string()]
        );
        assert_eq!(stale_devices(&snapshot, 130_000).len(), 1);
        assert_eq!(stale_devices(&snapshot, 130_001).len(), 2);
    }

    #[test]
    fn health_json_shape_works() {
        let health = Health {
            status: "ok",
            uptime_sec: 42,
            device_port: 5005,
            monitor_port: 5006,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "ok",
                "uptimeSec": 42,
                "devicePort": 5005,
                "monitorPort": 5006,
            })
        );
    }

    #[test]
    fn device_view_json_shape_works() {
        let json = serde_json::to_value(view("353691841005134", 7)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "deviceId": "353691841005134",
                "connectedAt": 0,
                "lastActivityAt": 7,
                "bytesReceived": 0,
                "packetsProcessed": 0,
            })
        );
    }
}
