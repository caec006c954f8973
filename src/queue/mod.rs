use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config,
    declare::{BackendHealth, QueueType},
    envelope::Envelope,
    error::{ConfigError, PublishError},
};

/// RabbitMQ
pub mod rabbitmq;
/// AWS SQS
pub mod sqs;

/// 後端確認收到訊息的回執。
#[derive(Debug, Clone, Default)]
pub struct Ack {
    pub backend_message_id: Option<String>,
}

/// 佇列後端的共通能力。
///
/// 連線握把由實作自行持有與重建，同一個握把上的重連互相序列化；
/// 呼叫端以同一封訊息重送時，實作必須可重入。
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 建立傳輸連線。啟動時呼叫一次，之後由 publish 在需要時重建。
    async fn connect(&self) -> Result<(), PublishError>;

    /// 發佈一封訊息，拿到後端的正面確認才回傳 Ack。
    async fn publish(&self, envelope: &Envelope) -> Result<Ack, PublishError>;

    /// 一次發佈多封訊息，預設逐封送出；支援批次的後端可覆寫。
    async fn publish_batch(&self, envelopes: &[Envelope]) -> Vec<Result<Ack, PublishError>> {
        let mut results = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            results.push(self.publish(envelope).await);
        }

        results
    }

    async fn health_check(&self) -> BackendHealth;

    /// 關機時強制釋放連線。
    async fn close(&self);
}

/// 依設定建立佇列後端，連線成敗交由呼叫端處理。
pub fn from_config(cfg: &config::App) -> Result<Arc<dyn QueueBackend>, ConfigError> {
    Ok(match cfg.queue_type()? {
        QueueType::Sqs => Arc::new(sqs::SqsBackend::new(cfg.queue.sqs.clone())),
        QueueType::RabbitMq => Arc::new(rabbitmq::RabbitMqBackend::new(cfg.queue.rabbitmq.clone())),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_builds_the_selected_backend() {
        let mut cfg = config::App::default();

        cfg.queue.queue_type = "rabbitmq".to_string();
        assert_eq!(from_config(&cfg).unwrap().name(), "rabbitmq");

        cfg.queue.queue_type = "sqs".to_string();
        assert_eq!(from_config(&cfg).unwrap().name(), "sqs");
    }

    #[test]
    fn test_from_config_rejects_unknown_backend() {
        let mut cfg = config::App::default();
        cfg.queue.queue_type = "kafka".to_string();

        assert!(from_config(&cfg).is_err());
    }
}
