//! 輪詢迴圈。
//!
//! 固定間隔驅動：每一輪對每個股票代號取得限流額度、呼叫行情來源、
//! 編碼後交給發佈 worker。行情來源的暫時性錯誤走指數退避，連續失敗
//! 達門檻時回報健康降級但永不停止輪詢；設定層級的錯誤只停掉該代號。
//! 同一個代號固定分配到同一個 worker，觀測值因此依取得順序發佈。

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use hashbrown::HashSet;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};

use crate::{
    config,
    dead_letter::DeadLetterSink,
    declare::BackendHealth,
    envelope::{self, Envelope},
    error::FetchError,
    health::HealthState,
    logging,
    publisher::{DeliveryResult, Publisher},
    queue::QueueBackend,
    rate_limiter::RateLimiter,
    source::DataSource,
    util::backoff,
};

/// 單一 worker 一次最多湊成的批次大小。
const WORKER_BATCH: usize = 10;
/// worker 佇列深度，滿了之後輪詢端會等待，形成背壓。
const WORKER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Idle,
    Fetching,
    Publishing,
    Backoff,
}

#[derive(Debug)]
enum PollFailure {
    /// 暫時性錯誤，退避後重試。
    Transient(String),
    /// 該代號停止輪詢。
    Halt(String),
}

pub struct Poller {
    source: Arc<dyn DataSource>,
    limiter: Arc<RateLimiter>,
    publisher: Arc<Publisher>,
    backend: Arc<dyn QueueBackend>,
    dead_letter: Arc<dyn DeadLetterSink>,
    health: Arc<HealthState>,
    cfg: config::Source,
    workers: usize,
    grace: Duration,
}

impl Poller {
    pub fn new(
        source: Arc<dyn DataSource>,
        limiter: Arc<RateLimiter>,
        publisher: Arc<Publisher>,
        backend: Arc<dyn QueueBackend>,
        dead_letter: Arc<dyn DeadLetterSink>,
        health: Arc<HealthState>,
        settings: &config::App,
    ) -> Self {
        Poller {
            source,
            limiter,
            publisher,
            backend,
            dead_letter,
            health,
            cfg: settings.source.clone(),
            workers: settings.publisher.workers,
            grace: Duration::from_secs(settings.system.shutdown_grace_secs),
        }
    }

    /// 一直輪詢到收到關機訊號：停止排程新的一輪、讓 worker 在寬限期內
    /// 送完手上的訊息，最後強制關閉後端連線。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (senders, handles) = self.spawn_workers();

        let mut interval = time::interval(Duration::from_secs(self.cfg.polling_interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut state = PollState::Idle;
        let mut consecutive_failures = 0u32;
        let mut degraded_by_fetch = false;
        let mut halted: HashSet<String> = HashSet::new();

        self.health.set_ready();
        logging::info_file_async(format!(
            "poller started: {} symbols from {} every {}s",
            self.cfg.symbols.len(),
            self.source.name(),
            self.cfg.polling_interval_secs
        ));

        'poll: loop {
            tokio::select! {
                _ = shutdown.changed() => break 'poll,
                _ = interval.tick() => {}
            }

            for symbol in &self.cfg.symbols {
                if halted.contains(symbol.as_str()) {
                    continue;
                }

                self.transition(&mut state, PollState::Fetching);

                let outcome = tokio::select! {
                    _ = shutdown.changed() => break 'poll,
                    outcome = self.poll_symbol(symbol, &senders, &mut state) => outcome,
                };

                match outcome {
                    Ok(()) => {
                        consecutive_failures = 0;
                        if degraded_by_fetch {
                            degraded_by_fetch = false;
                            self.health.set_healthy();
                        }
                    }
                    Err(PollFailure::Transient(why)) => {
                        consecutive_failures += 1;
                        self.transition(&mut state, PollState::Backoff);
                        logging::warn_file_async(format!(
                            "Failed to fetch {} because {} ({} consecutive failures)",
                            symbol, why, consecutive_failures
                        ));

                        if consecutive_failures >= self.cfg.max_consecutive_failures {
                            degraded_by_fetch = true;
                            self.health.set_degraded(format!(
                                "data source failing: {} consecutive fetch errors",
                                consecutive_failures
                            ));
                        }

                        let delay = backoff::delay_for(
                            consecutive_failures.saturating_sub(1),
                            Duration::from_millis(self.cfg.backoff_base_ms),
                            Duration::from_millis(self.cfg.backoff_cap_ms),
                        );

                        tokio::select! {
                            _ = shutdown.changed() => break 'poll,
                            _ = time::sleep(delay) => {}
                        }
                    }
                    Err(PollFailure::Halt(why)) => {
                        halted.insert(symbol.clone());
                        self.health
                            .set_degraded(format!("symbol {} halted: {}", symbol, why));
                        logging::error_file_async(format!(
                            "polling for {} halted because {}",
                            symbol, why
                        ));
                    }
                }
            }

            self.transition(&mut state, PollState::Idle);

            // 每一輪順帶確認後端連線狀態，斷路器負責健康回報，這裡只留紀錄
            match self.backend.health_check().await {
                BackendHealth::Healthy => {}
                BackendHealth::Degraded(why) => {
                    logging::warn_file_async(format!("queue backend degraded: {}", why));
                }
                BackendHealth::Unreachable(why) => {
                    logging::warn_file_async(format!("queue backend unreachable: {}", why));
                }
            }
        }

        logging::info_file_async("poller stopping, draining publish workers".to_string());
        drop(senders);

        if time::timeout(self.grace, join_all(handles)).await.is_err() {
            logging::warn_file_async(
                "publish workers did not drain before the grace deadline".to_string(),
            );
        }

        self.backend.close().await;
    }

    /// 一個代號的一輪：限流、取得觀測值、編碼、交給 worker。
    async fn poll_symbol(
        &self,
        symbol: &str,
        senders: &[mpsc::Sender<Envelope>],
        state: &mut PollState,
    ) -> Result<(), PollFailure> {
        self.limiter.acquire(1).await;

        let observation = match self.source.fetch(symbol).await {
            Ok(observation) => observation,
            Err(FetchError::NotFound(symbol)) => {
                logging::warn_file_async(format!(
                    "symbol {} not found at the data source",
                    symbol
                ));
                return Ok(());
            }
            Err(FetchError::Transient(why)) => {
                return Err(PollFailure::Transient(format!("{:?}", why)));
            }
            Err(FetchError::Fatal(why)) => {
                return Err(PollFailure::Halt(format!("{:?}", why)));
            }
        };

        self.transition(state, PollState::Publishing);

        match envelope::encode(&observation) {
            Ok(envelope) => {
                let index = worker_index(symbol, senders.len());
                if let Err(why) = senders[index].send(envelope).await {
                    // worker 已收工（關機中），交給死信避免無聲消失
                    self.dead_letter
                        .record(&why.0, "publish workers unavailable")
                        .await;
                }
            }
            Err(why) => {
                // 編碼失敗不重試，整筆直接進死信
                self.dead_letter
                    .record_observation(&observation, &why.to_string())
                    .await;
                logging::error_file_async(format!(
                    "Failed to encode an observation for {} because {}",
                    symbol, why
                ));
            }
        }

        Ok(())
    }

    fn spawn_workers(&self) -> (Vec<mpsc::Sender<Envelope>>, Vec<JoinHandle<()>>) {
        let mut senders = Vec::with_capacity(self.workers);
        let mut handles = Vec::with_capacity(self.workers);

        for id in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<Envelope>(WORKER_QUEUE_DEPTH);
            let publisher = Arc::clone(&self.publisher);

            handles.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let mut batch = vec![envelope];
                    while batch.len() < WORKER_BATCH {
                        match rx.try_recv() {
                            Ok(more) => batch.push(more),
                            Err(_) => break,
                        }
                    }

                    let results = if batch.len() == 1 {
                        vec![publisher.submit(batch.remove(0)).await]
                    } else {
                        publisher.submit_many(batch).await
                    };

                    for result in results {
                        if let DeliveryResult::DeadLettered { attempts, reason } = result {
                            logging::error_file_async(format!(
                                "worker {}: message dead-lettered after {} attempts: {}",
                                id, attempts, reason
                            ));
                        }
                    }
                }

                logging::debug_file_async(format!("publish worker {} drained", id));
            }));
            senders.push(tx);
        }

        (senders, handles)
    }

    fn transition(&self, state: &mut PollState, next: PollState) {
        if *state != next {
            logging::debug_file_async(format!("poller state {:?} -> {:?}", *state, next));
            *state = next;
        }
    }
}

/// 同一個代號永遠落在同一個 worker，保住單一代號的發佈順序。
fn worker_index(symbol: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);

    (hasher.finish() % workers as u64) as usize
}
