use std::time::Duration;

use thiserror::Error;

/// 啟動階段的設定錯誤，整個程式唯一允許因此結束的錯誤種類。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid configuration {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// 行情來源取得資料時的錯誤分類。
#[derive(Debug, Error)]
pub enum FetchError {
    /// 查無此股票代號，不重試。
    #[error("symbol {0} not found at the data source")]
    NotFound(String),
    /// 暫時性錯誤，輪詢端退避後重試。
    #[error("transient fetch failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// 設定層級的問題（API 金鑰無效等），該股票停止輪詢並回報健康狀態。
    #[error("fatal fetch failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

/// 觀測值無法編碼成佇列訊息時的錯誤，單筆直接進死信、不重試。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("observation is missing a symbol")]
    MissingSymbol,
    #[error("symbol {0:?} is not a valid ticker")]
    InvalidSymbol(String),
    #[error("observation is missing a capture timestamp")]
    MissingTimestamp,
}

/// 發佈到佇列後端時的錯誤分類。
#[derive(Debug, Error)]
pub enum PublishError {
    /// 連線或傳輸層失敗，重試到額度用盡為止。
    #[error("backend connection failure: {0}")]
    Connection(#[source] anyhow::Error),
    /// 斷路器開啟中，未實際送出請求。
    #[error("backend unavailable, circuit breaker is open")]
    Unavailable { retry_after: Option<Duration> },
    /// 後端回覆否定確認或拒收。
    #[error("backend rejected the message: {0}")]
    Rejected(String),
    /// 訊息本身超過後端的大小上限，重試不會改變結果。
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl PublishError {
    /// 重試是否有機會成功。
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PublishError::PayloadTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_retryability() {
        assert!(PublishError::Connection(anyhow::anyhow!("boom")).is_retryable());
        assert!(PublishError::Unavailable { retry_after: None }.is_retryable());
        assert!(PublishError::Rejected("nack".to_string()).is_retryable());
        assert!(!PublishError::PayloadTooLarge {
            size: 300_000,
            limit: 262_144
        }
        .is_retryable());
    }

    #[test]
    fn test_config_error_display_names_the_key() {
        let why = ConfigError::Invalid {
            key: "RATE_LIMIT",
            reason: "capacity must be greater than zero".to_string(),
        };
        assert!(why.to_string().contains("RATE_LIMIT"));
    }
}
