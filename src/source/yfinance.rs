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

pub const HOST: &str = "query1.finance.yahoo.com";

pub struct YFinance;

#[derive(Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    currency: Option<String>,
    regular_market_price: Option<f64>,
    chart_previous_close: Option<f64>,
    regular_market_time: Option<i64>,
}

#[async_trait]
impl DataSource for YFinance {
    fn name(&self) -> &'static str {
        "yfinance"
    }

    async fn fetch(&self, symbol: &str) -> Result<Observation, FetchError> {
        let url = format!(
            "https://{host}/v8/finance/chart/{symbol}?interval=1m&range=1d",
            host = HOST,
            symbol = symbol
        );
        let response: ChartResponse = source::fetch_json(&url, symbol).await?;

        let meta = match response
            .chart
            .result
            .and_then(|mut results| (!results.is_empty()).then(|| results.remove(0)))
        {
            Some(result) => result.meta,
            None => {
                if let Some(why) = response.chart.error {
                    crate::logging::debug_file_async(format!(
                        "chart api returned {} for {}: {}",
                        why.code, symbol, why.description
                    ));
                }
                return Err(FetchError::NotFound(symbol.to_string()));
            }
        };

        let price = meta
            .regular_market_price
            .and_then(Decimal::from_f64)
            .ok_or_else(|| {
                FetchError::Transient(anyhow!("chart meta for {} has no market price", symbol))
            })?;

        // 行情時間以交易所回報的時間為準，缺少時才退回抓取當下
        let captured_at = meta
            .regular_market_time
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        let mut fields = HashMap::from([("price".to_string(), FieldValue::Number(price.normalize()))]);

        if let Some(previous_close) = meta.chart_previous_close.and_then(Decimal::from_f64) {
            fields.insert(
                "previous_close".to_string(),
                FieldValue::Number(previous_close.normalize()),
            );
        }

        if let Some(currency) = meta.currency {
            fields.insert("currency".to_string(), FieldValue::Text(currency));
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
        "chart": {
            "result": [{
                "meta": {
                    "currency": "USD",
                    "symbol": "AAPL",
                    "regularMarketPrice": 190.12,
                    "chartPreviousClose": 189.5,
                    "regularMarketTime": 1754312400
                }
            }],
            "error": null
        }
    }"#;

    const NO_DATA: &str = r#"{
        "chart": {
            "result": null,
            "error": { "code": "Not Found", "description": "No data found, symbol may be delisted" }
        }
    }"#;

    #[test]
    fn test_chart_response_model() {
        let response: ChartResponse = serde_json::from_str(SAMPLE).unwrap();
        let meta = response.chart.result.unwrap().remove(0).meta;

        assert_eq!(meta.regular_market_price, Some(190.12));
        assert_eq!(meta.chart_previous_close, Some(189.5));
        assert_eq!(meta.currency.as_deref(), Some("USD"));
        assert_eq!(meta.regular_market_time, Some(1754312400));
    }

    #[test]
    fn test_chart_response_model_without_result() {
        let response: ChartResponse = serde_json::from_str(NO_DATA).unwrap();

        assert!(response.chart.result.is_none());
        assert_eq!(response.chart.error.unwrap().code, "Not Found");
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_live() {
        dotenv::dotenv().ok();
        logging::debug_file_async("開始 yfinance fetch".to_string());

        match YFinance.fetch("AAPL").await {
            Ok(observation) => {
                dbg!(&observation);
            }
            Err(why) => {
                logging::debug_file_async(format!("Failed to fetch because {:?}", why));
            }
        }

        logging::debug_file_async("結束 yfinance fetch".to_string());
    }
}
