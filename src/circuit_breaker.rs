//! 佇列後端的斷路器。
//!
//! 連續失敗達到門檻後切斷流量（Open），等待期滿轉入 HalfOpen 放行單一
//! 試探請求；試探成功即恢復（Closed），失敗則以加倍的等待時間重新開啟。
//! 所有狀態都以原子操作維護，多個發佈 worker 可同時讀寫。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;

use crate::{health::HealthState, logging};

/// 重新開啟時等待時間的放大上限（基礎等待時間的倍數）。
const MAX_REOPEN_FACTOR: u32 = 8;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// 連續失敗幾次後切斷流量。
    pub failure_threshold: u32,
    /// Open 狀態的基礎等待時間。
    pub open_wait: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            open_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "Closed"),
            BreakerState::Open => write!(f, "Open"),
            BreakerState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    health: Arc<HealthState>,
    tripped: AtomicBool,
    half_open: AtomicBool,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
    /// 目前 Open 狀態要等待的毫秒數，試探失敗時加倍。
    open_wait_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, health: Arc<HealthState>) -> Self {
        let open_wait_ms = config.open_wait.as_millis() as u64;

        CircuitBreaker {
            config,
            health,
            tripped: AtomicBool::new(false),
            half_open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            open_wait_ms: AtomicU64::new(open_wait_ms),
        }
    }

    /// 是否允許送出這一次請求。
    ///
    /// Open 狀態等待期滿時，第一個呼叫者成為 HalfOpen 的試探請求，
    /// 其餘呼叫者在試探結束前都會被擋下。
    pub fn allow_request(&self) -> bool {
        if !self.tripped.load(Ordering::Acquire) {
            return true;
        }

        if self.half_open.load(Ordering::Acquire) {
            // 試探請求已送出
            return false;
        }

        if !self.wait_elapsed() {
            return false;
        }

        if self
            .half_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            logging::info_file_async(
                "circuit breaker half-open, letting a probe request through".to_string(),
            );
            return true;
        }

        false
    }

    pub fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);

        if self.tripped.swap(false, Ordering::AcqRel) {
            self.half_open.store(false, Ordering::Release);
            self.open_wait_ms
                .store(self.config.open_wait.as_millis() as u64, Ordering::Release);
            self.health.set_healthy();
            logging::info_file_async("circuit breaker closed".to_string());
        }
    }

    /// 記錄一次失敗，回傳斷路器是否因此開啟。
    pub fn on_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if self.half_open.swap(false, Ordering::AcqRel) {
            // 試探失敗，等待時間加倍後重新開啟
            let base = self.config.open_wait.as_millis() as u64;
            let doubled = (self.open_wait_ms.load(Ordering::Acquire) * 2)
                .min(base * u64::from(MAX_REOPEN_FACTOR));
            self.trip(doubled);
            return true;
        }

        if !self.tripped.load(Ordering::Acquire) && failures >= self.config.failure_threshold {
            self.trip(self.config.open_wait.as_millis() as u64);
            return true;
        }

        false
    }

    pub fn state(&self) -> BreakerState {
        if !self.tripped.load(Ordering::Acquire) {
            return BreakerState::Closed;
        }

        if self.half_open.load(Ordering::Acquire) {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// 距離下一次允許試探還要等多久，Closed 狀態回傳 None。
    pub fn retry_after(&self) -> Option<Duration> {
        if !self.tripped.load(Ordering::Acquire) {
            return None;
        }

        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let wait = self.open_wait_ms.load(Ordering::Acquire) as i64;
        let remaining = opened_at + wait - Utc::now().timestamp_millis();

        Some(Duration::from_millis(remaining.max(0) as u64))
    }

    fn trip(&self, wait_ms: u64) {
        self.tripped.store(true, Ordering::Release);
        self.half_open.store(false, Ordering::Release);
        self.open_wait_ms.store(wait_ms, Ordering::Release);
        self.opened_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.health
            .set_degraded(format!("queue backend circuit breaker open for {}ms", wait_ms));
        logging::warn_file_async(format!("circuit breaker open, waiting {}ms", wait_ms));
    }

    fn wait_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let wait = self.open_wait_ms.load(Ordering::Acquire) as i64;

        Utc::now().timestamp_millis() - opened_at >= wait
    }
}
