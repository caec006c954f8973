//! 觀測值與佇列訊息的封裝。
//!
//! [`encode`] 將一筆 [`Observation`] 轉成要發佈的 [`Envelope`]。
//! 訊息編號由股票代號、來源與觀測時間決定，同一筆觀測值不論重送幾次
//! 編號都相同，下游依編號即可去除重複。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::EncodeError, util::map::Keyable};

/// 目前的訊息格式版本
pub const SCHEMA_VERSION: u32 = 1;

static SYMBOL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9.\-]{0,11}$").expect("symbol pattern"));

/// 從行情來源取得的單筆觀測值，建立後不再變動。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub symbol: String,
    pub fields: HashMap<String, FieldValue>,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

/// 觀測值欄位，數值欄位一律用 Decimal 避免浮點誤差。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(Decimal),
    Text(String),
}

/// 發佈到佇列上的訊息。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub schema_version: u32,
    pub symbol: String,
    pub captured_at: DateTime<Utc>,
    pub fields: HashMap<String, FieldValue>,
    pub source: String,
    pub produced_at: DateTime<Utc>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Keyable for Envelope {
    fn key(&self) -> String {
        self.message_id.clone()
    }

    fn key_with_prefix(&self) -> String {
        format!("envelope:{}", self.message_id)
    }
}

/// 將觀測值編碼成佇列訊息。
pub fn encode(observation: &Observation) -> Result<Envelope, EncodeError> {
    validate(observation)?;

    Ok(Envelope {
        message_id: message_id(observation),
        schema_version: SCHEMA_VERSION,
        symbol: observation.symbol.clone(),
        captured_at: observation.captured_at,
        fields: observation.fields.clone(),
        source: observation.source.clone(),
        produced_at: Utc::now(),
    })
}

fn validate(observation: &Observation) -> Result<(), EncodeError> {
    if observation.symbol.is_empty() {
        return Err(EncodeError::MissingSymbol);
    }

    if !SYMBOL_PATTERN.is_match(&observation.symbol) {
        return Err(EncodeError::InvalidSymbol(observation.symbol.clone()));
    }

    if observation.captured_at.timestamp_micros() <= 0 {
        return Err(EncodeError::MissingTimestamp);
    }

    Ok(())
}

/// 訊息編號：對股票代號、來源與觀測時間（微秒）做 SHA-256。
pub fn message_id(observation: &Observation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(observation.symbol.as_bytes());
    hasher.update(b"\n");
    hasher.update(observation.source.as_bytes());
    hasher.update(b"\n");
    hasher.update(observation.captured_at.timestamp_micros().to_be_bytes());

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    pub(crate) fn sample_observation(symbol: &str) -> Observation {
        Observation {
            symbol: symbol.to_string(),
            fields: HashMap::from([
                ("price".to_string(), FieldValue::Number(dec!(190.12))),
                ("currency".to_string(), FieldValue::Text("USD".to_string())),
            ]),
            captured_at: Utc.with_ymd_and_hms(2026, 8, 3, 13, 30, 0).unwrap(),
            source: "yfinance".to_string(),
        }
    }

    #[test]
    fn test_message_id_is_deterministic() {
        let observation = sample_observation("AAPL");
        let first = encode(&observation).unwrap();
        let second = encode(&observation).unwrap();

        assert_eq!(first.message_id, second.message_id);
        assert_eq!(first.message_id.len(), 64);
    }

    #[test]
    fn test_message_id_changes_with_capture_time() {
        let observation = sample_observation("AAPL");
        let mut later = sample_observation("AAPL");
        later.captured_at = observation.captured_at + chrono::Duration::seconds(1);

        assert_ne!(message_id(&observation), message_id(&later));
    }

    #[test]
    fn test_message_id_changes_with_source() {
        let observation = sample_observation("AAPL");
        let mut other = sample_observation("AAPL");
        other.source = "polygon".to_string();

        assert_ne!(message_id(&observation), message_id(&other));
    }

    #[test]
    fn test_encode_rejects_missing_symbol() {
        let mut observation = sample_observation("AAPL");
        observation.symbol = String::new();

        assert_eq!(encode(&observation).unwrap_err(), EncodeError::MissingSymbol);
    }

    #[test]
    fn test_encode_rejects_malformed_symbol() {
        let mut observation = sample_observation("AAPL");
        observation.symbol = "aapl!!".to_string();

        assert_eq!(
            encode(&observation).unwrap_err(),
            EncodeError::InvalidSymbol("aapl!!".to_string())
        );
    }

    #[test]
    fn test_encode_accepts_class_share_symbols() {
        assert!(encode(&sample_observation("BRK.B")).is_ok());
        assert!(encode(&sample_observation("2330.TW")).is_ok());
    }

    #[test]
    fn test_encode_rejects_missing_timestamp() {
        let mut observation = sample_observation("AAPL");
        observation.captured_at = Utc.timestamp_opt(0, 0).unwrap();

        assert_eq!(
            encode(&observation).unwrap_err(),
            EncodeError::MissingTimestamp
        );
    }

    #[test]
    fn test_wire_format_keys() {
        let envelope = encode(&sample_observation("AAPL")).unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();

        for key in [
            "message_id",
            "schema_version",
            "symbol",
            "captured_at",
            "fields",
            "source",
            "produced_at",
        ] {
            assert!(wire.get(key).is_some(), "wire format is missing {}", key);
        }
        assert_eq!(wire["schema_version"], SCHEMA_VERSION);
        assert_eq!(wire["fields"]["price"], serde_json::json!("190.12"));
    }

    #[test]
    fn test_keyable_uses_message_id() {
        let envelope = encode(&sample_observation("AAPL")).unwrap();

        assert_eq!(envelope.key(), envelope.message_id);
        assert_eq!(
            envelope.key_with_prefix(),
            format!("envelope:{}", envelope.message_id)
        );
    }
}
