use std::{env, path::PathBuf, str::FromStr};

use config::{Config as config_config, File as config_file};
use serde::{Deserialize, Serialize};

use crate::{
    declare::{QueueType, StockApiType},
    error::ConfigError,
};

const CONFIG_PATH: &str = "app.json";

const STOCK_API_TYPE: &str = "STOCK_API_TYPE";
const SYMBOLS: &str = "SYMBOLS";
const POLLING_INTERVAL: &str = "POLLING_INTERVAL";
const RATE_LIMIT: &str = "RATE_LIMIT";
const RATE_LIMIT_WINDOW: &str = "RATE_LIMIT_WINDOW";
const ALPHA_VANTAGE_API_KEY: &str = "ALPHA_VANTAGE_API_KEY";
const POLYGON_API_KEY: &str = "POLYGON_API_KEY";
const MAX_CONSECUTIVE_FAILURES: &str = "MAX_CONSECUTIVE_FAILURES";
const POLL_BACKOFF_MS: &str = "POLL_BACKOFF_MS";
const POLL_BACKOFF_CAP_MS: &str = "POLL_BACKOFF_CAP_MS";

/// 輪詢與行情來源設定
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Source {
    pub api_type: String,
    pub symbols: Vec<String>,
    pub polling_interval_secs: u64,
    pub rate_limit: u32,
    pub rate_limit_window_secs: u64,
    pub alpha_vantage_api_key: String,
    pub polygon_api_key: String,
    pub max_consecutive_failures: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for Source {
    fn default() -> Self {
        Source {
            api_type: "yfinance".to_string(),
            symbols: Vec::new(),
            polling_interval_secs: 60,
            rate_limit: 5,
            rate_limit_window_secs: 1,
            alpha_vantage_api_key: String::new(),
            polygon_api_key: String::new(),
            max_consecutive_failures: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
        }
    }
}

const QUEUE_TYPE: &str = "QUEUE_TYPE";
const SQS_QUEUE_URL: &str = "SQS_QUEUE_URL";
const SQS_REGION: &str = "SQS_REGION";

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(default)]
pub struct Queue {
    pub queue_type: String,
    pub sqs: Sqs,
    pub rabbitmq: RabbitMq,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Sqs {
    pub queue_url: String,
    pub region: String,
}

impl Default for Sqs {
    fn default() -> Self {
        Sqs {
            queue_url: String::new(),
            region: "us-east-1".to_string(),
        }
    }
}

const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
const RABBITMQ_USER: &str = "RABBITMQ_USER";
const RABBITMQ_PASS: &str = "RABBITMQ_PASS";
const RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
const RABBITMQ_QUEUE_NAME: &str = "RABBITMQ_QUEUE_NAME";
const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RabbitMq {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub queue_name: String,
    pub exchange: String,
}

impl Default for RabbitMq {
    fn default() -> Self {
        RabbitMq {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue_name: "stock_queue".to_string(),
            exchange: String::new(),
        }
    }
}

const MAX_RETRIES: &str = "MAX_RETRIES";
const RETRY_DELAY: &str = "RETRY_DELAY";
const MAX_BACKOFF_MS: &str = "MAX_BACKOFF_MS";
const PUBLISH_WORKERS: &str = "PUBLISH_WORKERS";

/// 發佈端的重試與 worker 設定
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Publisher {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_backoff_ms: u64,
    pub workers: usize,
}

impl Default for Publisher {
    fn default() -> Self {
        Publisher {
            max_retries: 5,
            retry_delay_ms: 500,
            max_backoff_ms: 30_000,
            workers: 4,
        }
    }
}

const BREAKER_FAILURE_THRESHOLD: &str = "BREAKER_FAILURE_THRESHOLD";
const BREAKER_OPEN_SECS: &str = "BREAKER_OPEN_SECS";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Breaker {
    pub failure_threshold: u32,
    pub open_secs: u64,
}

impl Default for Breaker {
    fn default() -> Self {
        Breaker {
            failure_threshold: 5,
            open_secs: 30,
        }
    }
}

const HEALTHCHECK_PORT: &str = "HEALTHCHECK_PORT";
const SHUTDOWN_GRACE_SECS: &str = "SHUTDOWN_GRACE_SECS";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct System {
    pub healthcheck_port: u16,
    pub shutdown_grace_secs: u64,
}

impl Default for System {
    fn default() -> Self {
        System {
            healthcheck_port: 8081,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(default)]
pub struct App {
    pub source: Source,
    pub queue: Queue,
    pub publisher: Publisher,
    pub breaker: Breaker,
    pub system: System,
}

impl App {
    /// 讀取設定並驗證，只在啟動時呼叫一次，驗證結果交給各工廠使用。
    pub fn get() -> Result<Self, ConfigError> {
        let app = Self::load().override_with_env();
        app.validate()?;

        Ok(app)
    }

    /// 有設定檔時先讀設定檔，沒有時使用預設值。
    fn load() -> Self {
        let config_path = config_path();
        if !config_path.exists() {
            return Default::default();
        }

        match config_config::builder()
            .add_source(config_file::from(config_path))
            .build()
            .and_then(|config| config.try_deserialize::<App>())
        {
            Ok(app) => app,
            Err(why) => {
                crate::logging::error_file_async(format!(
                    "I can't read the config context because {:?}",
                    why
                ));
                Default::default()
            }
        }
    }

    /// 將來自於 env 的設定值覆蓋掉設定檔上的設定值
    fn override_with_env(mut self) -> Self {
        if let Ok(api_type) = env::var(STOCK_API_TYPE) {
            self.source.api_type = api_type;
        }

        if let Ok(symbols) = env::var(SYMBOLS) {
            self.source.symbols = parse_symbols(&symbols);
        }

        if let Ok(interval) = env::var(POLLING_INTERVAL) {
            self.source.polling_interval_secs = u64::from_str(&interval).unwrap_or(60);
        }

        if let Ok(rate_limit) = env::var(RATE_LIMIT) {
            self.source.rate_limit = u32::from_str(&rate_limit).unwrap_or(5);
        }

        if let Ok(window) = env::var(RATE_LIMIT_WINDOW) {
            self.source.rate_limit_window_secs = u64::from_str(&window).unwrap_or(1);
        }

        if let Ok(key) = env::var(ALPHA_VANTAGE_API_KEY) {
            self.source.alpha_vantage_api_key = key;
        }

        if let Ok(key) = env::var(POLYGON_API_KEY) {
            self.source.polygon_api_key = key;
        }

        if let Ok(failures) = env::var(MAX_CONSECUTIVE_FAILURES) {
            self.source.max_consecutive_failures = u32::from_str(&failures).unwrap_or(5);
        }

        if let Ok(base) = env::var(POLL_BACKOFF_MS) {
            self.source.backoff_base_ms = u64::from_str(&base).unwrap_or(1_000);
        }

        if let Ok(cap) = env::var(POLL_BACKOFF_CAP_MS) {
            self.source.backoff_cap_ms = u64::from_str(&cap).unwrap_or(60_000);
        }

        if let Ok(queue_type) = env::var(QUEUE_TYPE) {
            self.queue.queue_type = queue_type;
        }

        if let Ok(url) = env::var(SQS_QUEUE_URL) {
            self.queue.sqs.queue_url = url;
        }

        if let Ok(region) = env::var(SQS_REGION) {
            self.queue.sqs.region = region;
        }

        if let Ok(host) = env::var(RABBITMQ_HOST) {
            self.queue.rabbitmq.host = host;
        }

        if let Ok(port) = env::var(RABBITMQ_PORT) {
            self.queue.rabbitmq.port = u16::from_str(&port).unwrap_or(5672);
        }

        if let Ok(user) = env::var(RABBITMQ_USER) {
            self.queue.rabbitmq.user = user;
        }

        if let Ok(password) = env::var(RABBITMQ_PASS) {
            self.queue.rabbitmq.password = password;
        }

        if let Ok(vhost) = env::var(RABBITMQ_VHOST) {
            self.queue.rabbitmq.vhost = vhost;
        }

        if let Ok(queue_name) = env::var(RABBITMQ_QUEUE_NAME) {
            self.queue.rabbitmq.queue_name = queue_name;
        }

        if let Ok(exchange) = env::var(RABBITMQ_EXCHANGE) {
            self.queue.rabbitmq.exchange = exchange;
        }

        if let Ok(max_retries) = env::var(MAX_RETRIES) {
            self.publisher.max_retries = u32::from_str(&max_retries).unwrap_or(5);
        }

        if let Ok(delay) = env::var(RETRY_DELAY) {
            self.publisher.retry_delay_ms = u64::from_str(&delay).unwrap_or(500);
        }

        if let Ok(cap) = env::var(MAX_BACKOFF_MS) {
            self.publisher.max_backoff_ms = u64::from_str(&cap).unwrap_or(30_000);
        }

        if let Ok(workers) = env::var(PUBLISH_WORKERS) {
            self.publisher.workers = usize::from_str(&workers).unwrap_or(4);
        }

        if let Ok(threshold) = env::var(BREAKER_FAILURE_THRESHOLD) {
            self.breaker.failure_threshold = u32::from_str(&threshold).unwrap_or(5);
        }

        if let Ok(open_secs) = env::var(BREAKER_OPEN_SECS) {
            self.breaker.open_secs = u64::from_str(&open_secs).unwrap_or(30);
        }

        if let Ok(port) = env::var(HEALTHCHECK_PORT) {
            self.system.healthcheck_port = u16::from_str(&port).unwrap_or(8081);
        }

        if let Ok(grace) = env::var(SHUTDOWN_GRACE_SECS) {
            self.system.shutdown_grace_secs = u64::from_str(&grace).unwrap_or(10);
        }

        self
    }

    pub fn api_type(&self) -> Result<StockApiType, ConfigError> {
        StockApiType::from_str(&self.source.api_type).map_err(|_| ConfigError::Invalid {
            key: STOCK_API_TYPE,
            reason: format!(
                "must be one of {} (got {:?})",
                StockApiType::iterator()
                    .map(|api_type| api_type.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.source.api_type
            ),
        })
    }

    pub fn queue_type(&self) -> Result<QueueType, ConfigError> {
        QueueType::from_str(&self.queue.queue_type).map_err(|_| ConfigError::Invalid {
            key: QUEUE_TYPE,
            reason: format!(
                "must be one of {} (got {:?})",
                QueueType::iterator()
                    .map(|queue_type| queue_type.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.queue.queue_type
            ),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.source.symbols.is_empty() {
            return Err(ConfigError::Missing(SYMBOLS));
        }

        match self.api_type()? {
            StockApiType::AlphaVantage if self.source.alpha_vantage_api_key.is_empty() => {
                return Err(ConfigError::Missing(ALPHA_VANTAGE_API_KEY));
            }
            StockApiType::Polygon if self.source.polygon_api_key.is_empty() => {
                return Err(ConfigError::Missing(POLYGON_API_KEY));
            }
            _ => {}
        }

        if self.queue_type()? == QueueType::Sqs && self.queue.sqs.queue_url.is_empty() {
            return Err(ConfigError::Missing(SQS_QUEUE_URL));
        }

        if self.source.rate_limit == 0 {
            return Err(ConfigError::Invalid {
                key: RATE_LIMIT,
                reason: "capacity must be greater than zero".to_string(),
            });
        }

        if self.source.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid {
                key: RATE_LIMIT_WINDOW,
                reason: "window must be greater than zero".to_string(),
            });
        }

        if self.source.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: POLLING_INTERVAL,
                reason: "interval must be greater than zero".to_string(),
            });
        }

        if self.publisher.max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_RETRIES,
                reason: "at least one attempt is required".to_string(),
            });
        }

        if self.publisher.workers == 0 {
            return Err(ConfigError::Invalid {
                key: PUBLISH_WORKERS,
                reason: "at least one worker is required".to_string(),
            });
        }

        Ok(())
    }
}

/// 股票代號清單：逗號分隔，去除空白並轉成大寫。
fn parse_symbols(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|symbol| symbol.trim().to_uppercase())
        .filter(|symbol| !symbol.is_empty())
        .collect()
}

/// 回傳設定檔的路徑
fn config_path() -> PathBuf {
    PathBuf::from(CONFIG_PATH)
}
