use std::{collections::HashMap, str::FromStr};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{
    envelope::{FieldValue, Observation},
    error::FetchError,
    source::{self, DataSource},
};

pub const HOST: &str = "www.alphavantage.co";

pub struct AlphaVantage {
    api_key: String,
}

impl AlphaVantage {
    pub fn new(api_key: String) -> Self {
        AlphaVantage { api_key }
    }
}

#[derive(Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    global_quote: Option<GlobalQuote>,
    /// 免費方案超量時 API 以 200 回應一段說明文字
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: Option<String>,
    #[serde(rename = "05. price")]
    price: Option<String>,
    #[serde(rename = "06. volume")]
    volume: Option<String>,
    #[serde(rename = "07. latest trading day")]
    latest_trading_day: Option<String>,
    #[serde(rename = "10. change percent")]
    change_percent: Option<String>,
}

#[async_trait]
impl DataSource for AlphaVantage {
    fn name(&self) -> &'static str {
        "alpha_vantage"
    }

    async fn fetch(&self, symbol: &str) -> Result<Observation, FetchError> {
        let url = format!(
            "https://{host}/query?function=GLOBAL_QUOTE&symbol={symbol}&apikey={key}",
            host = HOST,
            symbol = symbol,
            key = self.api_key
        );
        let response: GlobalQuoteResponse = source::fetch_json(&url, symbol).await?;

        if let Some(note) = response.note {
            return Err(FetchError::Transient(anyhow!("rate limited: {}", note)));
        }

        if let Some(why) = response.error_message {
            return Err(FetchError::Fatal(anyhow!("{}", why)));
        }

        let quote = match response.global_quote {
            // 查無代號時 API 回傳空的 Global Quote 物件
            Some(quote) if quote.symbol.is_some() => quote,
            _ => return Err(FetchError::NotFound(symbol.to_string())),
        };

        let price = quote
            .price
            .as_deref()
            .and_then(|price| Decimal::from_str(price).ok())
            .ok_or_else(|| {
                FetchError::Transient(anyhow!("global quote for {} has no price", symbol))
            })?;

        // 只有交易日日期可用，同一天的重複輪詢會得到相同的觀測時間
        let captured_at = quote
            .latest_trading_day
            .as_deref()
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            .map(|day| day.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or_else(Utc::now);

        let mut fields = HashMap::from([("price".to_string(), FieldValue::Number(price))]);

        if let Some(volume) = quote
            .volume
            .as_deref()
            .and_then(|volume| Decimal::from_str(volume).ok())
        {
            fields.insert("volume".to_string(), FieldValue::Number(volume));
        }

        if let Some(change_percent) = quote.change_percent {
            fields.insert("change_percent".to_string(), FieldValue::Text(change_percent));
        }

        Ok(Observation {
            symbol: symbol.to_string(),
            fields,
            captured_at,
            source: self.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    const SAMPLE: &str = r#"{
        "Global Quote": {
            "01. symbol": "AAPL",
            "02. open": "189.50",
            "05. price": "190.1200",
            "06. volume": "58499129",
            "07. latest trading day": "2026-08-04",
            "10. change percent": "0.3272%"
        }
    }"#;

    const EMPTY: &str = r#"{ "Global Quote": {} }"#;

    const THROTTLED: &str = r#"{
        "Note": "Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day."
    }"#;

    #[test]
    fn test_global_quote_model() {
        let response: GlobalQuoteResponse = serde_json::from_str(SAMPLE).unwrap();
        let quote = response.global_quote.unwrap();

        assert_eq!(quote.symbol.as_deref(), Some("AAPL"));
        assert_eq!(quote.price.as_deref(), Some("190.1200"));
        assert_eq!(quote.latest_trading_day.as_deref(), Some("2026-08-04"));
    }

    #[test]
    fn test_empty_quote_means_unknown_symbol() {
        let response: GlobalQuoteResponse = serde_json::from_str(EMPTY).unwrap();

        assert!(response.global_quote.unwrap().symbol.is_none());
    }

    #[test]
    fn test_note_model() {
        let response: GlobalQuoteResponse = serde_json::from_str(THROTTLED).unwrap();

        assert!(response.note.is_some());
        assert!(response.global_quote.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_live() {
        dotenv::dotenv().ok();
        logging::debug_file_async("開始 alpha_vantage fetch".to_string());

        let source = AlphaVantage::new(
            std::env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_else(|_| "demo".to_string()),
        );

        match source.fetch("IBM").await {
            Ok(observation) => {
                dbg!(&observation);
            }
            Err(why) => {
                logging::debug_file_async(format!("Failed to fetch because {:?}", why));
            }
        }

        logging::debug_file_async("結束 alpha_vantage fetch".to_string());
    }
}
