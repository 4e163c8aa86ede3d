//! Request Shield
//!
//! This is the main entry point for the request shield service.
//! It initializes the security pipeline and starts the web server.

use std::sync::{Arc, Mutex};

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use request_shield::api::{self, ApiState, BlockList, RequestGuard};
use request_shield::config;
use request_shield::core::{LoggingObserver, RateLimiter, SecurityMonitor, SystemClock};
use request_shield::utils::duration_from_ms;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Starting request shield...");

    let config = Arc::new(config::load_config().context("Failed to load configuration")?);

    let prometheus = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    let clock = Arc::new(SystemClock);

    let rate_limiter = Arc::new(RateLimiter::with_clock(config.rate_limit.clone(), clock.clone()));
    rate_limiter.start_cleanup();

    let block_list = Arc::new(BlockList::new(
        duration_from_ms(config.monitoring.block_duration_secs.saturating_mul(1000)),
        clock.clone(),
    ));

    let mut monitor = SecurityMonitor::with_clock(&config.monitoring, clock);
    monitor.add_observer(Arc::new(LoggingObserver));
    monitor.add_observer(block_list.clone());
    let monitor = Arc::new(Mutex::new(monitor));

    let guard = RequestGuard::new(rate_limiter.clone(), monitor.clone(), block_list.clone());
    let state = web::Data::new(ApiState {
        rate_limiter: rate_limiter.clone(),
        monitor,
        block_list,
        config: config.clone(),
        prometheus,
    });

    info!(
        "Listening on {}:{} ({} requests per {} ms)",
        config.server.host, config.server.port, config.rate_limit.max_requests, config.rate_limit.window_ms
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(guard.clone())
            .configure(api::config)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    rate_limiter.destroy();
    info!("Request shield stopped");
    Ok(())
}
