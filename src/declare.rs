use strum_macros::{Display, EnumString};

/// 行情 API 的種類
#[derive(Display, EnumString, PartialEq, Eq, Debug, Copy, Clone)]
#[strum(serialize_all = "snake_case")]
pub enum StockApiType {
    /// Yahoo Finance 相容介面
    #[strum(serialize = "yfinance")]
    YFinance,
    /// Alpha Vantage
    AlphaVantage,
    /// Polygon.io
    Polygon,
}

impl StockApiType {
    pub fn iterator() -> impl Iterator<Item = Self> {
        [Self::YFinance, Self::AlphaVantage, Self::Polygon]
            .iter()
            .copied()
    }
}

/// 佇列後端的種類
#[derive(Display, EnumString, PartialEq, Eq, Debug, Copy, Clone)]
pub enum QueueType {
    #[strum(serialize = "sqs")]
    Sqs,
    #[strum(serialize = "rabbitmq")]
    RabbitMq,
}

impl QueueType {
    pub fn iterator() -> impl Iterator<Item = Self> {
        [Self::Sqs, Self::RabbitMq].iter().copied()
    }
}

/// 佇列後端健康檢查的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHealth {
    Healthy,
    Degraded(String),
    Unreachable(String),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_stock_api_type_from_str() {
        assert_eq!(
            StockApiType::from_str("yfinance").ok(),
            Some(StockApiType::YFinance)
        );
        assert_eq!(
            StockApiType::from_str("alpha_vantage").ok(),
            Some(StockApiType::AlphaVantage)
        );
        assert_eq!(
            StockApiType::from_str("polygon").ok(),
            Some(StockApiType::Polygon)
        );
        assert!(StockApiType::from_str("bloomberg").is_err());
    }

    #[test]
    fn test_queue_type_round_trip() {
        for queue_type in QueueType::iterator() {
            assert_eq!(
                QueueType::from_str(&queue_type.to_string()).ok(),
                Some(queue_type)
            );
        }
    }
}
