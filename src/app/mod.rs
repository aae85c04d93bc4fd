use crate::config::Config;
use crate::homeassistant::HaClient;
use crate::monitor::Monitor;
use crate::ts3::Ts3Session;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;

    let api_key = config
        .ts3
        .api_key
        .clone()
        .ok_or("missing ts3.api_key in config")?;
    let base_url = config
        .homeassistant
        .base_url
        .as_deref()
        .ok_or("missing homeassistant.base_url in config")?;
    let token = config
        .homeassistant
        .token
        .as_deref()
        .ok_or("missing homeassistant.token in config")?;
    let entity_id = config
        .homeassistant
        .entity_id
        .as_deref()
        .ok_or("missing homeassistant.entity_id in config")?;

    let ha = HaClient::new(
        base_url,
        token,
        entity_id,
        Duration::from_millis(config.homeassistant.request_timeout_ms),
    )?;

    // Seed the cache from the entity's current state; a failed read is
    // not fatal and falls back to the inactive baseline.
    let initial_active = match ha.get_state().await {
        Ok(state) => {
            tracing::info!(%state, "initial home assistant state");
            state == "on"
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to read initial home assistant state, assuming off");
            false
        }
    };

    let session = Ts3Session::new(
        config.ts3.address.clone(),
        Duration::from_millis(config.ts3.connect_timeout_ms),
        Duration::from_millis(config.ts3.read_timeout_ms),
    );
    let monitor = Monitor::new(
        session,
        api_key,
        ha,
        initial_active,
        Duration::from_millis(config.monitor.poll_interval_ms),
        Duration::from_millis(config.monitor.retry_interval_ms),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    wait_for_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    monitor_task.await?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
