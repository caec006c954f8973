use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::{prelude::FromPrimitive, Decimal};
use serde::Deserialize;

use crate::{
    envelope::{FieldValue, Observation},
    error::FetchError,
    source::{self, DataSource},
};

pub const HOST: &str = "api.polygon.io";

pub struct Polygon {
    api_key: String,
}

impl Polygon {
    pub fn new(api_key: String) -> Self {
        Polygon { api_key }
    }
}

#[derive(Deserialize)]
struct PrevCloseResponse {
    status: Option<String>,
    #[serde(rename = "resultsCount")]
    results_count: Option<i64>,
    results: Option<Vec<PrevBar>>,
}

/// 前一交易日的聚合 K 棒
#[derive(Deserialize)]
struct PrevBar {
    /// close
    c: f64,
    /// open
    o: f64,
    /// high
    h: f64,
    /// low
    l: f64,
    /// volume
    v: f64,
    /// 收盤時間（毫秒）
    t: i64,
}

#[async_trait]
impl DataSource for Polygon {
    fn name(&self) -> &'static str {
        "polygon"
    }

    async fn fetch(&self, symbol: &str) -> Result<Observation, FetchError> {
        let url = format!(
            "https://{host}/v2/aggs/ticker/{symbol}/prev?adjusted=true&apiKey={key}",
            host = HOST,
            symbol = symbol,
            key = self.api_key
        );
        let response: PrevCloseResponse = source::fetch_json(&url, symbol).await?;

        let bar = match response
            .results
            .and_then(|mut bars| (!bars.is_empty()).then(|| bars.remove(0)))
        {
            Some(bar) => bar,
            None => {
                crate::logging::debug_file_async(format!(
                    "polygon returned status {:?} with {:?} results for {}",
                    response.status, response.results_count, symbol
                ));
                return Err(FetchError::NotFound(symbol.to_string()));
            }
        };

        let captured_at = Utc
            .timestamp_millis_opt(bar.t)
            .single()
            .unwrap_or_else(Utc::now);

        let mut fields = HashMap::new();
        for (name, value) in [
            ("close", bar.c),
            ("open", bar.o),
            ("high", bar.h),
            ("low", bar.l),
            ("volume", bar.v),
        ] {
            if let Some(value) = Decimal::from_f64(value) {
                fields.insert(name.to_string(), FieldValue::Number(value.normalize()));
            }
        }

        if fields.is_empty() {
            return Err(FetchError::Transient(anyhow!(
                "previous close for {} has no usable fields",
                symbol
            )));
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
        "ticker": "AAPL",
        "status": "OK",
        "resultsCount": 1,
        "results": [{
            "T": "AAPL",
            "c": 190.12,
            "o": 189.2,
            "h": 191.05,
            "l": 188.9,
            "v": 58499129.0,
            "t": 1754337600000
        }]
    }"#;

    const EMPTY: &str = r#"{ "ticker": "NOPE", "status": "OK", "resultsCount": 0, "results": [] }"#;

    #[test]
    fn test_prev_close_model() {
        let response: PrevCloseResponse = serde_json::from_str(SAMPLE).unwrap();
        let bar = response.results.unwrap().remove(0);

        assert_eq!(bar.c, 190.12);
        assert_eq!(bar.t, 1754337600000);
        assert_eq!(response.results_count, Some(1));
    }

    #[test]
    fn test_prev_close_model_without_results() {
        let response: PrevCloseResponse = serde_json::from_str(EMPTY).unwrap();

        assert!(response.results.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_live() {
        dotenv::dotenv().ok();
        logging::debug_file_async("開始 polygon fetch".to_string());

        let source =
            Polygon::new(std::env::var("POLYGON_API_KEY").unwrap_or_default());

        match source.fetch("AAPL").await {
            Ok(observation) => {
                dbg!(&observation);
            }
            Err(why) => {
                logging::debug_file_async(format!("Failed to fetch because {:?}", why));
            }
        }

        logging::debug_file_async("結束 polygon fetch".to_string());
    }
}
