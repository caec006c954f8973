use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::{
    types::{QueueAttributeName, SendMessageBatchRequestEntry},
    Client,
};
use tokio::sync::OnceCell;

use crate::{
    config,
    declare::BackendHealth,
    envelope::Envelope,
    error::PublishError,
    logging,
    queue::{Ack, QueueBackend},
};

/// SQS 單封訊息的大小上限（256 KB）。
const MAX_PAYLOAD_BYTES: usize = 262_144;
/// SendMessageBatch 一次最多十封。
const MAX_BATCH_ENTRIES: usize = 10;

/// AWS SQS 後端。
///
/// SDK 的 client 內含連線池，第一次使用時才初始化。
/// FIFO 佇列（.fifo 結尾）時帶上去重權杖與訊息群組，
/// 一般佇列的去重交由下游依訊息編號處理。
pub struct SqsBackend {
    cfg: config::Sqs,
    client: OnceCell<Client>,
}

impl SqsBackend {
    pub fn new(cfg: config::Sqs) -> Self {
        SqsBackend {
            cfg,
            client: OnceCell::new(),
        }
    }

    fn is_fifo(&self) -> bool {
        self.cfg.queue_url.ends_with(".fifo")
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.cfg.region.clone()))
                    .load()
                    .await;

                Client::new(&shared)
            })
            .await
    }

    fn body_for(&self, envelope: &Envelope) -> Result<String, PublishError> {
        let body = envelope
            .to_bytes()
            .map_err(|why| PublishError::Rejected(format!("serialize failed: {}", why)))?;

        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(PublishError::PayloadTooLarge {
                size: body.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        String::from_utf8(body)
            .map_err(|why| PublishError::Rejected(format!("payload is not utf-8: {}", why)))
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    fn name(&self) -> &'static str {
        "sqs"
    }

    async fn connect(&self) -> Result<(), PublishError> {
        self.client()
            .await
            .get_queue_attributes()
            .queue_url(&self.cfg.queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|why| PublishError::Connection(anyhow!(why)))?;

        logging::info_file_async(format!("connected to sqs queue {}", self.cfg.queue_url));

        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<Ack, PublishError> {
        let body = self.body_for(envelope)?;

        let mut request = self
            .client()
            .await
            .send_message()
            .queue_url(&self.cfg.queue_url)
            .message_body(body);

        if self.is_fifo() {
            request = request
                .message_deduplication_id(&envelope.message_id)
                .message_group_id(&envelope.symbol);
        }

        let output = request
            .send()
            .await
            .map_err(|why| PublishError::Connection(anyhow!(why)))?;

        Ok(Ack {
            backend_message_id: output.message_id().map(str::to_string),
        })
    }

    /// 以 SendMessageBatch 一次送十封。批次內只要有失敗就整批回報失敗，
    /// 由發佈端逐封重送；已成功的重複訊息靠訊息編號（FIFO 另有去重權杖）吸收。
    async fn publish_batch(&self, envelopes: &[Envelope]) -> Vec<Result<Ack, PublishError>> {
        let mut results: Vec<Result<Ack, PublishError>> = Vec::with_capacity(envelopes.len());

        for chunk in envelopes.chunks(MAX_BATCH_ENTRIES) {
            let mut entries = Vec::with_capacity(chunk.len());
            let mut chunk_results: Vec<Option<Result<Ack, PublishError>>> =
                chunk.iter().map(|_| None).collect();

            for (index, envelope) in chunk.iter().enumerate() {
                match self.body_for(envelope) {
                    Ok(body) => {
                        let mut entry = SendMessageBatchRequestEntry::builder()
                            .id(index.to_string())
                            .message_body(body);

                        if self.is_fifo() {
                            entry = entry
                                .message_deduplication_id(&envelope.message_id)
                                .message_group_id(&envelope.symbol);
                        }

                        match entry.build() {
                            Ok(entry) => entries.push(entry),
                            Err(why) => {
                                chunk_results[index] = Some(Err(PublishError::Rejected(format!(
                                    "batch entry rejected: {}",
                                    why
                                ))));
                            }
                        }
                    }
                    Err(why) => chunk_results[index] = Some(Err(why)),
                }
            }

            let outcome = if entries.is_empty() {
                None
            } else {
                Some(
                    self.client()
                        .await
                        .send_message_batch()
                        .queue_url(&self.cfg.queue_url)
                        .set_entries(Some(entries))
                        .send()
                        .await,
                )
            };

            for slot in chunk_results {
                results.push(match slot {
                    Some(result) => result,
                    None => match &outcome {
                        Some(Ok(output)) if output.failed().is_empty() => Ok(Ack::default()),
                        Some(Ok(output)) => Err(PublishError::Rejected(format!(
                            "{} of the batch entries were rejected",
                            output.failed().len()
                        ))),
                        Some(Err(why)) => Err(PublishError::Connection(anyhow!(
                            "batch send failed: {}",
                            why
                        ))),
                        None => Err(PublishError::Rejected(
                            "batch entry was never sent".to_string(),
                        )),
                    },
                });
            }
        }

        results
    }

    async fn health_check(&self) -> BackendHealth {
        match self
            .client()
            .await
            .get_queue_attributes()
            .queue_url(&self.cfg.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
        {
            Ok(_) => BackendHealth::Healthy,
            Err(why) => BackendHealth::Unreachable(format!("{}", why)),
        }
    }

    async fn close(&self) {
        // SDK client 沒有需要釋放的連線握把
        logging::debug_file_async("sqs backend closed".to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::envelope::{self, FieldValue, Observation};

    fn backend(queue_url: &str) -> SqsBackend {
        let mut cfg = config::Sqs::default();
        cfg.queue_url = queue_url.to_string();
        SqsBackend::new(cfg)
    }

    fn sample_envelope() -> Envelope {
        let observation = Observation {
            symbol: "AAPL".to_string(),
            fields: HashMap::from([(
                "price".to_string(),
                FieldValue::Text("190.12".to_string()),
            )]),
            captured_at: Utc.with_ymd_and_hms(2026, 8, 3, 13, 30, 0).unwrap(),
            source: "yfinance".to_string(),
        };

        envelope::encode(&observation).expect("encode")
    }

    #[test]
    fn test_fifo_detection() {
        assert!(backend("https://sqs.us-east-1.amazonaws.com/1/stock_queue.fifo").is_fifo());
        assert!(!backend("https://sqs.us-east-1.amazonaws.com/1/stock_queue").is_fifo());
    }

    #[test]
    fn test_oversized_payload_is_rejected_without_a_network_call() {
        let backend = backend("https://sqs.us-east-1.amazonaws.com/1/stock_queue");
        let mut envelope = sample_envelope();
        envelope.fields.insert(
            "padding".to_string(),
            FieldValue::Text("x".repeat(MAX_PAYLOAD_BYTES)),
        );

        match backend.body_for(&envelope) {
            Err(PublishError::PayloadTooLarge { size, limit }) => {
                assert!(size > limit);
                assert_eq!(limit, MAX_PAYLOAD_BYTES);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_normal_payload_passes_the_size_guard() {
        let backend = backend("https://sqs.us-east-1.amazonaws.com/1/stock_queue");

        assert!(backend.body_for(&sample_envelope()).is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_publish_live() {
        dotenv::dotenv().ok();

        let queue_url = match std::env::var("SQS_QUEUE_URL") {
            Ok(url) => url,
            Err(_) => return,
        };

        let backend = backend(&queue_url);
        backend.connect().await.expect("connect");

        match backend.publish(&sample_envelope()).await {
            Ok(ack) => {
                dbg!(&ack);
            }
            Err(why) => {
                crate::logging::debug_file_async(format!("Failed to publish because {:?}", why));
            }
        }
    }
}
