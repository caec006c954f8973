use async_trait::async_trait;

use crate::{
    envelope::{Envelope, Observation},
    logging,
};

/// 無法送達的訊息最後的去處。
///
/// 收集端自行負責緩衝與落地，任何失敗都不可影響呼叫端，
/// 所以這裡的介面沒有回傳錯誤的餘地。
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// 記錄一封耗盡重試額度的訊息。
    async fn record(&self, envelope: &Envelope, reason: &str);

    /// 記錄一筆還來不及編碼成訊息的觀測值。
    async fn record_observation(&self, observation: &Observation, reason: &str);
}

/// 預設實作：完整內容寫入日誌，交由日誌蒐集管道撈取。
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn record(&self, envelope: &Envelope, reason: &str) {
        let payload = serde_json::to_string(envelope)
            .unwrap_or_else(|_| format!("{{\"message_id\":\"{}\"}}", envelope.message_id));

        logging::error_file_async(format!(
            "dead-letter message {} because {}: {}",
            envelope.message_id, reason, payload
        ));
    }

    async fn record_observation(&self, observation: &Observation, reason: &str) {
        let payload = serde_json::to_string(observation)
            .unwrap_or_else(|_| format!("{{\"symbol\":\"{}\"}}", observation.symbol));

        logging::error_file_async(format!(
            "dead-letter observation for {} because {}: {}",
            observation.symbol, reason, payload
        ));
    }
}
