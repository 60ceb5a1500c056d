// DANS : src/main.rs

use anyhow::{Context, Result};
use poolwatch::{
    config::Config,
    detection::{DetectorConfig, PoolDetector, load_profiles},
    monitoring::logging::setup_logging,
    rpc::{ConnectionManager, RetrySettings, SolanaTransport},
};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let config = Config::load().context("chargement de la configuration échoué")?;
    info!(
        endpoints = config.endpoints().len(),
        scan_interval_ms = config.scan_interval_ms,
        "démarrage de poolwatch"
    );

    let transport = Arc::new(SolanaTransport::new());
    let connection = Arc::new(ConnectionManager::new(
        config.endpoints(),
        transport,
        RetrySettings {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            failover_threshold: config.failover_threshold,
        },
    )?);
    let health_loop =
        connection.start_health_loop(Duration::from_millis(config.health_check_interval_ms));

    let profiles = load_profiles(config.exchange_profiles_path.as_deref())
        .context("chargement des tables d'exchanges échoué")?;
    let (detector, mut events) = PoolDetector::new(
        connection.clone(),
        DetectorConfig {
            profiles,
            scan_interval: Duration::from_millis(config.scan_interval_ms),
            event_queue_size: config.event_queue_size,
        },
        None,
    );
    detector.start().await?;

    // Le binaire se contente de consommer le flux : l'aval (filtrage,
    // exécution) vit dans d'autres services.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("signal d'arrêt reçu");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let pool = &event.pool;
                        info!(
                            pool = %pool.address,
                            exchange = %pool.exchange,
                            source = ?pool.source,
                            "pool publié sur le flux de détection"
                        );
                    }
                    None => {
                        error!("flux de détection fermé de manière inattendue");
                        break;
                    }
                }
            }
        }
    }

    detector.stop().await;
    health_loop.abort();
    warn!("poolwatch arrêté");
    Ok(())
}
