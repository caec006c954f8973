pub mod circuit_breaker;
pub mod config;
pub mod dead_letter;
pub mod declare;
pub mod envelope;
pub mod error;
pub mod health;
pub mod logging;
pub mod poller;
pub mod publisher;
pub mod queue;
pub mod rate_limiter;
pub mod source;
pub mod util;

use std::{env, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::watch;

use crate::{
    circuit_breaker::{BreakerConfig, CircuitBreaker},
    dead_letter::{DeadLetterSink, LogDeadLetterSink},
    health::HealthState,
    poller::Poller,
    publisher::{Publisher, RetryPolicy},
    rate_limiter::RateLimiter,
};

#[cfg(all(target_os = "linux", target_env = "musl"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // 設定錯誤是唯一允許讓程式結束的錯誤
    let settings = match config::App::get() {
        Ok(settings) => settings,
        Err(why) => {
            logging::error_console(format!("Failed to load configuration because {}", why));
            std::process::exit(1);
        }
    };

    logging::info_file_async(format!(
        "StockPoller 已啟動\r\nRust OS/Arch: {}/{}",
        env::consts::OS,
        env::consts::ARCH
    ));

    let health = Arc::new(HealthState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let health = Arc::clone(&health);
        let shutdown_rx = shutdown_rx.clone();
        let port = settings.system.healthcheck_port;
        tokio::spawn(async move {
            if let Err(why) = health::serve(health, port, shutdown_rx).await {
                logging::error_file_async(format!(
                    "Failed to start the health server because {:?}",
                    why
                ));
            }
        });
    }

    let source = source::from_config(&settings)?;
    let backend = queue::from_config(&settings)?;

    // 後端連不上不結束程式：回報降級，發佈時會自行重連
    if let Err(why) = backend.connect().await {
        logging::error_file_async(format!(
            "Failed to connect to {} because {}",
            backend.name(),
            why
        ));
        health.set_degraded(format!("queue backend unreachable: {}", why));
    }

    let limiter = Arc::new(RateLimiter::new(
        settings.source.rate_limit,
        Duration::from_secs(settings.source.rate_limit_window_secs),
    )?);
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig {
            failure_threshold: settings.breaker.failure_threshold,
            open_wait: Duration::from_secs(settings.breaker.open_secs),
        },
        Arc::clone(&health),
    ));
    let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(LogDeadLetterSink);
    let publisher = Arc::new(Publisher::new(
        Arc::clone(&backend),
        Arc::clone(&breaker),
        Arc::clone(&dead_letter),
        RetryPolicy::from(&settings.publisher),
    ));

    let poller = Poller::new(
        source,
        limiter,
        publisher,
        backend,
        dead_letter,
        Arc::clone(&health),
        &settings,
    );

    tokio::spawn(async move {
        if let Err(why) = tokio::signal::ctrl_c().await {
            logging::error_file_async(format!(
                "Failed to listen for the shutdown signal because {:?}",
                why
            ));
            return;
        }

        logging::info_file_async("shutdown signal received".to_string());
        let _ = shutdown_tx.send(true);
    });

    poller.run(shutdown_rx).await;
    logging::info_file_async("stock poller stopped".to_string());

    Ok(())
}
