use std::collections::HashMap;
use std::process::ExitCode;

use ceems_core::config::Config;
use ceems_core::db::Db;
use ceems_core::errors::exit_code;
use ceems_core::fetcher::{registry, FetcherManager};
use ceems_core::health::{self, HealthState};
use ceems_core::scheduler::Scheduler;
use ceems_core::tsdb::TsdbClient;
use ceems_core::updater::TsdbUpdater;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("CEEMS_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "config validation failed");
            return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let fetcher_registry = registry::register_all();
    if let Err(e) = registry::validate_managers_known(&fetcher_registry, &config.clusters) {
        error!(error = %e, "config validation failed");
        return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
    }

    let fetchers = match fetcher_registry.build_all(&config.clusters) {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "failed to build fetchers from config");
            return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
        }
    };
    let fetcher_manager = FetcherManager::new(fetchers);

    let db_path = std::env::var("CEEMS_DB_PATH").unwrap_or_else(|_| "ceems.db".to_string());
    let db = match Db::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, db_path, "failed to open or migrate database");
            return ExitCode::from(exit_code::DATABASE_OPEN_FAILURE as u8);
        }
    };

    let mut updaters = HashMap::new();
    for updater_cfg in &config.updaters {
        // `Config::validate` already rejects an unknown `updater:` kind at
        // startup; this match is the dispatch point that decision guards —
        // today there is exactly one registered kind, but adding a second
        // means adding an arm here, not widening what falls through to tsdb.
        match updater_cfg.updater.as_str() {
            "tsdb" => {
                let web = updater_cfg.web.clone().unwrap_or_default();
                let client = TsdbClient::new(web.url, web.headers);
                match TsdbUpdater::bootstrap(client, updater_cfg.extra_config.clone()).await {
                    Ok(updater) => {
                        updaters.insert(updater_cfg.id.clone(), updater);
                    }
                    Err(e) => {
                        error!(error = %e, updater_id = %updater_cfg.id, "failed to bootstrap TSDB updater");
                        return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
                    }
                }
            }
            other => {
                error!(updater_id = %updater_cfg.id, kind = other, "unknown updater kind");
                return ExitCode::from(exit_code::CONFIG_VALIDATION_FAILURE as u8);
            }
        }
    }

    let cluster_updaters: HashMap<String, Vec<String>> = config
        .clusters
        .iter()
        .map(|c| (c.id.clone(), c.updaters.clone()))
        .collect();

    let health_state = HealthState::new();
    let scheduler = Scheduler::new(
        db,
        fetcher_manager,
        updaters,
        cluster_updaters,
        config.ceems_api_server.data.update_interval,
        config.ceems_api_server.data.users_interval,
        health_state.clone(),
    );

    let health_router = health::router(health_state);
    let health_addr = config.ceems_api_server.health_addr.clone();

    let shutdown = CancellationToken::new();

    let server_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&health_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, health_addr, "failed to bind health listener, continuing without it");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, health_router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
        {
            error!(error = %e, "health server exited with error");
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let result = scheduler.run(shutdown.clone()).await;
    shutdown.cancel();
    let _ = health_task.await;

    match result {
        Ok(()) => ExitCode::from(exit_code::OK as u8),
        Err(e) => {
            error!(error = %e, "scheduler stopped on a fatal error");
            ExitCode::from(exit_code::FATAL_WRITE_ERROR as u8)
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
