//! 訊息發佈與送達保證。
//!
//! [`Publisher::submit`] 負責把一封訊息送進佇列後端：重試到額度用盡，
//! 耗盡後交給死信收集端，絕不無聲丟棄。同一個訊息編號同一時間只會有
//! 一個發佈在進行，最近已確認送達的編號在短時間內不再重送，
//! 重複輪詢到的同一筆觀測值因此不會放大成重複訊息。

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hashbrown::HashSet;
use moka::sync::Cache;

use crate::{
    circuit_breaker::CircuitBreaker,
    config,
    dead_letter::DeadLetterSink,
    envelope::Envelope,
    error::PublishError,
    logging,
    queue::QueueBackend,
    util::{backoff, map::Keyable},
};

/// 已確認送達的訊息編號保留多久。
const ACKED_TTL: Duration = Duration::from_secs(300);
const ACKED_CAPACITY: u64 = 100_000;

/// submit 的最終結果。每一封進來的訊息都落在其中一種，沒有第五種出路。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// 後端正面確認收到。
    Delivered { attempts: u32 },
    /// 相同編號最近已送達，這一封不再重送。
    Duplicate,
    /// 相同編號已有另一個發佈正在進行，這一封讓路。
    InFlight,
    /// 重試額度用盡或訊息本身無法送達，已交給死信收集端。
    DeadLettered { attempts: u32, reason: String },
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeliveryResult::Delivered { .. } | DeliveryResult::Duplicate
        )
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&config::Publisher> for RetryPolicy {
    fn from(cfg: &config::Publisher) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_delay_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

type InFlightSet = Arc<Mutex<HashSet<String>>>;

fn release_in_flight(entry: (InFlightSet, String)) {
    let (set, key) = entry;
    let mut guard = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.remove(&key);
}

pub struct Publisher {
    backend: Arc<dyn QueueBackend>,
    breaker: Arc<CircuitBreaker>,
    dead_letter: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    in_flight: InFlightSet,
    recently_acked: Cache<String, ()>,
}

impl Publisher {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        breaker: Arc<CircuitBreaker>,
        dead_letter: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Publisher {
            backend,
            breaker,
            dead_letter,
            policy,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            recently_acked: Cache::builder()
                .max_capacity(ACKED_CAPACITY)
                .time_to_live(ACKED_TTL)
                .build(),
        }
    }

    /// 送出一封訊息並等到有明確的結果。
    pub async fn submit(&self, envelope: Envelope) -> DeliveryResult {
        if let Some(early) = self.try_begin(&envelope) {
            return early;
        }

        let _release = scopeguard::guard(
            (Arc::clone(&self.in_flight), envelope.key()),
            release_in_flight,
        );

        self.deliver(&envelope).await
    }

    /// 一次送出多封訊息。支援批次的後端先走一輪批次，
    /// 批次中可重試的失敗再逐封走 [`Self::submit`] 相同的重試路徑。
    pub async fn submit_many(&self, envelopes: Vec<Envelope>) -> Vec<DeliveryResult> {
        let mut results: Vec<Option<DeliveryResult>> = envelopes.iter().map(|_| None).collect();
        let mut guards = Vec::new();
        let mut pending = Vec::new();

        for (index, envelope) in envelopes.iter().enumerate() {
            match self.try_begin(envelope) {
                Some(early) => results[index] = Some(early),
                None => {
                    guards.push(scopeguard::guard(
                        (Arc::clone(&self.in_flight), envelope.key()),
                        release_in_flight,
                    ));
                    pending.push(index);
                }
            }
        }

        if pending.len() > 1 && self.breaker.allow_request() {
            let batch: Vec<Envelope> = pending.iter().map(|&index| envelopes[index].clone()).collect();
            let batch_results = self.backend.publish_batch(&batch).await;
            let mut delivered = 0usize;

            for (&index, result) in pending.iter().zip(batch_results.iter()) {
                match result {
                    Ok(_) => {
                        self.recently_acked
                            .insert(envelopes[index].key_with_prefix(), ());
                        results[index] = Some(DeliveryResult::Delivered { attempts: 1 });
                        delivered += 1;
                    }
                    Err(why) if !why.is_retryable() => {
                        self.dead_letter
                            .record(&envelopes[index], &why.to_string())
                            .await;
                        results[index] = Some(DeliveryResult::DeadLettered {
                            attempts: 1,
                            reason: why.to_string(),
                        });
                    }
                    Err(_) => {}
                }
            }

            if delivered > 0 {
                self.breaker.on_success();
            } else {
                self.breaker.on_failure();
            }
        }

        for &index in &pending {
            if results[index].is_none() {
                results[index] = Some(self.deliver(&envelopes[index]).await);
            }
        }

        drop(guards);

        results
            .into_iter()
            .map(|result| result.unwrap_or(DeliveryResult::InFlight))
            .collect()
    }

    /// 去重與單一進行中檢查，回傳 Some 表示這一封不需要發佈。
    fn try_begin(&self, envelope: &Envelope) -> Option<DeliveryResult> {
        if self.recently_acked.contains_key(&envelope.key_with_prefix()) {
            logging::debug_file_async(format!(
                "{} was recently acknowledged, not republishing",
                envelope.message_id
            ));
            return Some(DeliveryResult::Duplicate);
        }

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !in_flight.insert(envelope.key()) {
            return Some(DeliveryResult::InFlight);
        }

        None
    }

    /// 重試到額度用盡。斷路器開啟時該次嘗試直接失敗，不打後端。
    async fn deliver(&self, envelope: &Envelope) -> DeliveryResult {
        let mut attempts = 0u32;
        let mut last_error: Option<PublishError> = None;

        while attempts < self.policy.max_attempts {
            if attempts > 0 {
                let delay =
                    backoff::delay_for(attempts - 1, self.policy.base_delay, self.policy.max_delay);
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            if !self.breaker.allow_request() {
                logging::warn_file_async(format!(
                    "circuit breaker open, publish of {} deferred (attempt {}/{})",
                    envelope.message_id, attempts, self.policy.max_attempts
                ));
                last_error = Some(PublishError::Unavailable {
                    retry_after: self.breaker.retry_after(),
                });
                continue;
            }

            match self.backend.publish(envelope).await {
                Ok(_) => {
                    self.breaker.on_success();
                    self.recently_acked.insert(envelope.key_with_prefix(), ());

                    if attempts > 1 {
                        logging::info_file_async(format!(
                            "{} delivered after {} attempts",
                            envelope.message_id, attempts
                        ));
                    }

                    return DeliveryResult::Delivered { attempts };
                }
                Err(why) if !why.is_retryable() => {
                    self.dead_letter.record(envelope, &why.to_string()).await;
                    logging::error_file_async(format!(
                        "{} can never be delivered, routed to the dead letter sink: {}",
                        envelope.message_id, why
                    ));

                    return DeliveryResult::DeadLettered {
                        attempts,
                        reason: why.to_string(),
                    };
                }
                Err(why) => {
                    self.breaker.on_failure();
                    logging::warn_file_async(format!(
                        "Failed to publish {} because {} (attempt {}/{})",
                        envelope.message_id, why, attempts, self.policy.max_attempts
                    ));
                    last_error = Some(why);
                }
            }
        }

        let reason = last_error
            .map(|why| why.to_string())
            .unwrap_or_else(|| "retry budget exhausted".to_string());

        self.dead_letter.record(envelope, &reason).await;
        logging::error_file_async(format!(
            "{} exhausted its retry budget, routed to the dead letter sink: {}",
            envelope.message_id, reason
        ));

        DeliveryResult::DeadLettered { attempts, reason }
    }
}
