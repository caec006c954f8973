use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::{
    config,
    declare::StockApiType,
    envelope::Observation,
    error::{ConfigError, FetchError},
    util,
};

/// Alpha Vantage
pub mod alpha_vantage;
/// Polygon.io
pub mod polygon;
/// Yahoo Finance（yfinance 相容介面）
pub mod yfinance;

/// 行情資料來源的共通能力。
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// 取得單一股票目前的觀測值。
    async fn fetch(&self, symbol: &str) -> Result<Observation, FetchError>;
}

/// 依設定建立資料來源。
pub fn from_config(cfg: &config::App) -> Result<Arc<dyn DataSource>, ConfigError> {
    Ok(match cfg.api_type()? {
        StockApiType::YFinance => Arc::new(yfinance::YFinance),
        StockApiType::AlphaVantage => Arc::new(alpha_vantage::AlphaVantage::new(
            cfg.source.alpha_vantage_api_key.clone(),
        )),
        StockApiType::Polygon => {
            Arc::new(polygon::Polygon::new(cfg.source.polygon_api_key.clone()))
        }
    })
}

/// 送出 GET，依 HTTP 狀態碼分類錯誤後反序列化回應。
pub(crate) async fn fetch_json<RES: DeserializeOwned>(
    url: &str,
    symbol: &str,
) -> Result<RES, FetchError> {
    let response = util::http::get_response(url)
        .await
        .map_err(FetchError::Transient)?;

    classify_status(response, symbol)?
        .json::<RES>()
        .await
        .map_err(|e| FetchError::Transient(anyhow!("Error parsing response JSON: {:?}", e)))
}

/// 404 表示查無代號、401/403 是金鑰問題、429 與 5xx 可重試。
fn classify_status(response: Response, symbol: &str) -> Result<Response, FetchError> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(FetchError::NotFound(symbol.to_string()));
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::Fatal(anyhow!(
            "request rejected with {}: check the API key",
            status
        )));
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(FetchError::Transient(anyhow!(
            "data source returned {}",
            status
        )));
    }

    if status.is_client_error() {
        return Err(FetchError::Fatal(anyhow!(
            "data source rejected the request with {}",
            status
        )));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_builds_the_selected_adapter() {
        let mut cfg = config::App::default();
        cfg.source.api_type = "yfinance".to_string();
        assert_eq!(from_config(&cfg).unwrap().name(), "yfinance");

        cfg.source.api_type = "alpha_vantage".to_string();
        cfg.source.alpha_vantage_api_key = "demo".to_string();
        assert_eq!(from_config(&cfg).unwrap().name(), "alpha_vantage");

        cfg.source.api_type = "polygon".to_string();
        cfg.source.polygon_api_key = "demo".to_string();
        assert_eq!(from_config(&cfg).unwrap().name(), "polygon");
    }

    #[test]
    fn test_from_config_rejects_unknown_api_type() {
        let mut cfg = config::App::default();
        cfg.source.api_type = "bloomberg".to_string();

        assert!(from_config(&cfg).is_err());
    }
}
