//! 健康狀態與探針端點。
//!
//! [`HealthState`] 由輪詢端與斷路器回報狀態轉換，`/health` 與 `/ready`
//! 供容器調度平台的 liveness/readiness 探針讀取。
//! 每個情境都能建立獨立的 `HealthState`，不依賴全域變數。

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::sync::watch;

use crate::logging;

pub struct HealthState {
    ready: AtomicBool,
    healthy: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        HealthState {
            ready: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// 啟動流程完成，可以開始接收流量。
    pub fn set_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            logging::info_file_async("service marked as ready".to_string());
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 回報服務降級與原因，原因會出現在 `/health` 的回應內容。
    pub fn set_degraded(&self, reason: String) {
        let was_healthy = self.healthy.swap(false, Ordering::AcqRel);

        if let Ok(mut guard) = self.reason.write() {
            *guard = Some(reason.clone());
        }

        if was_healthy {
            logging::warn_file_async(format!("service degraded: {}", reason));
        }
    }

    /// 解除降級狀態。
    pub fn set_healthy(&self) {
        let was_healthy = self.healthy.swap(true, Ordering::AcqRel);

        if let Ok(mut guard) = self.reason.write() {
            *guard = None;
        }

        if !was_healthy {
            logging::info_file_async("service recovered".to_string());
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> (bool, Option<String>) {
        let reason = match self.reason.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };

        (self.healthy.load(Ordering::Acquire), reason)
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_probe))
        .route("/ready", get(ready_probe))
        .with_state(state)
}

async fn health_probe(State(state): State<Arc<HealthState>>) -> (StatusCode, String) {
    match state.snapshot() {
        (true, _) => (StatusCode::OK, "healthy".to_string()),
        (false, reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            reason.unwrap_or_else(|| "degraded".to_string()),
        ),
    }
}

async fn ready_probe(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// 啟動探針伺服器，收到關機訊號後結束。
pub async fn serve(
    state: Arc<HealthState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    logging::info_file_async(format!("health probes listening on port {}", port));

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
