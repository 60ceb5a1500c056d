// DANS : tests/detection_flow.rs
//
// Scénarios de bout en bout du détecteur : transport simulé injecté sous le
// gestionnaire de connexion, notifications push et scans programmés, et
// vérification du flux d'événements côté consommateur.

use anyhow::Result;
use async_trait::async_trait;
use poolwatch::detection::{
    DetectionEvent, DetectionSource, DetectorConfig, DexKind, ExchangeProfile, PoolDetector,
    PoolRecord, PoolSnapshotSource, default_profiles,
    profiles::{PUMP_AMM_PROGRAM_ID, RAYDIUM_AMM_V4_PROGRAM_ID},
};
use poolwatch::rpc::{ConnectionManager, RetrySettings, RpcError, mock::MockTransport};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};

const SCAN_INTERVAL: Duration = Duration::from_millis(200);

fn profile_for(exchange: DexKind) -> ExchangeProfile {
    default_profiles()
        .into_iter()
        .find(|p| p.exchange == exchange)
        .unwrap()
}

/// Fabrique un compte pool conforme à la table d'heuristiques de l'exchange.
fn synthetic_pool(profile: &ExchangeProfile, base_mint: &Pubkey, quote_mint: &Pubkey) -> Vec<u8> {
    let mut data = vec![0u8; profile.pool_account_size];
    if let Some(discriminator) = &profile.discriminator {
        data[..discriminator.len()].copy_from_slice(discriminator);
    }
    data[profile.base_mint_offset..profile.base_mint_offset + 32]
        .copy_from_slice(base_mint.as_ref());
    data[profile.quote_mint_offset..profile.quote_mint_offset + 32]
        .copy_from_slice(quote_mint.as_ref());
    data
}

fn detector_with(
    transport: Arc<MockTransport>,
    profiles: Vec<ExchangeProfile>,
) -> (PoolDetector, mpsc::Receiver<DetectionEvent>, Arc<ConnectionManager>) {
    let connection = Arc::new(
        ConnectionManager::new(
            vec!["http://primaire".to_string(), "http://secours".to_string()],
            transport,
            RetrySettings {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                failover_threshold: 2,
            },
        )
        .unwrap(),
    );
    let (detector, events) = PoolDetector::new(
        connection.clone(),
        DetectorConfig {
            profiles,
            scan_interval: SCAN_INTERVAL,
            event_queue_size: 64,
        },
        None,
    );
    (detector, events, connection)
}

async fn next_event(events: &mut mpsc::Receiver<DetectionEvent>) -> DetectionEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("aucun événement reçu dans le délai")
        .expect("flux d'événements fermé")
}

async fn expect_no_event(events: &mut mpsc::Receiver<DetectionEvent>) {
    let outcome = timeout(Duration::from_secs(2), events.recv()).await;
    assert!(outcome.is_err(), "événement inattendu: {:?}", outcome.unwrap());
}

#[tokio::test(start_paused = true)]
async fn push_then_scan_of_same_pool_emits_a_single_event() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::RaydiumAmmV4);
    let pool = Pubkey::new_unique();
    let data = synthetic_pool(&profile, &Pubkey::new_unique(), &Pubkey::new_unique());

    // Le même pool arrivera par les deux canaux : push d'abord, scan ensuite.
    transport.set_program_accounts(RAYDIUM_AMM_V4_PROGRAM_ID, vec![(pool, data.clone())]);

    let (detector, mut events, _) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();

    transport
        .push_account_update(RAYDIUM_AMM_V4_PROGRAM_ID, pool, data)
        .await;

    let event = next_event(&mut events).await;
    assert_eq!(event.pool.address, pool);
    assert_eq!(event.pool.source, DetectionSource::PushAccount);
    let first_seen = event.pool.clone();

    // Les timestamps des records suivent l'horloge système, que la pause du
    // temps tokio ne fige pas : on la laisse franchir quelques millisecondes
    // pour observer l'avancée de `last_updated_ms`.
    std::thread::sleep(Duration::from_millis(5));

    // On laisse passer plusieurs scans : la redécouverte ne ré-émet jamais,
    // elle ne fait qu'avancer `last_updated_ms` sur le record existant.
    tokio::time::sleep(SCAN_INTERVAL * 3).await;
    expect_no_event(&mut events).await;

    let pools = detector.known_pools();
    assert_eq!(pools.len(), 1);
    assert!(pools[0].last_updated_ms > first_seen.last_updated_ms);
    assert_eq!(pools[0].first_detected_ms, first_seen.first_detected_ms);
    assert_eq!(pools[0].source, DetectionSource::PushAccount);

    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pool_missed_by_push_is_found_by_the_periodic_scan() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::PumpAmm);
    let pool = Pubkey::new_unique();
    let base_mint = Pubkey::new_unique();
    let quote_mint = Pubkey::new_unique();
    let data = synthetic_pool(&profile, &base_mint, &quote_mint);
    transport.set_program_accounts(PUMP_AMM_PROGRAM_ID, vec![(pool, data)]);

    let (detector, mut events, _) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();

    // Aucune notification push : seul le scan de rattrapage peut le trouver,
    // au plus un intervalle après le démarrage.
    let event = next_event(&mut events).await;
    assert_eq!(event.pool.address, pool);
    assert_eq!(event.pool.source, DetectionSource::PeriodicScan);
    assert_eq!(event.pool.base_mint, base_mint);
    assert_eq!(event.pool.quote_mint, quote_mint);

    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn creation_logs_trigger_transaction_lookup_and_detection() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::OrcaWhirlpool);
    let program = profile.program_id;
    let pool = Pubkey::new_unique();
    let data = synthetic_pool(&profile, &Pubkey::new_unique(), &Pubkey::new_unique());
    let signature = Signature::new_unique();

    // La transaction de création implique le pool et des comptes annexes qui
    // n'appartiennent pas au programme : seuls les comptes du programme comptent.
    transport.set_account(pool, program, data);
    let stranger = Pubkey::new_unique();
    transport.set_account(stranger, Pubkey::new_unique(), vec![0; 64]);
    transport.set_transaction_accounts(signature, vec![stranger, pool]);

    let (detector, mut events, _) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();

    transport
        .push_logs(
            program,
            &signature,
            vec!["Program log: Instruction: InitializePoolV2".to_string()],
        )
        .await;

    let event = next_event(&mut events).await;
    assert_eq!(event.pool.address, pool);
    assert_eq!(event.pool.source, DetectionSource::PushLog);
    assert_eq!(event.pool.exchange, DexKind::OrcaWhirlpool);

    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn logs_without_creation_keywords_are_ignored() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::RaydiumAmmV4);
    let signature = Signature::new_unique();

    let (detector, mut events, _) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();

    transport
        .push_logs(
            RAYDIUM_AMM_V4_PROGRAM_ID,
            &signature,
            vec!["Program log: Instruction: Swap".to_string()],
        )
        .await;

    expect_no_event(&mut events).await;
    // Aucune récupération de transaction ne doit avoir été tentée.
    assert_eq!(transport.call_count("get_transaction"), 0);

    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_are_idempotent() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::RaydiumAmmV4);

    let (detector, _events, connection) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();
    detector.start().await.unwrap();

    // Un seul jeu d'abonnements malgré le double démarrage.
    assert_eq!(transport.account_subscription_count(&RAYDIUM_AMM_V4_PROGRAM_ID), 1);
    assert_eq!(transport.logs_subscription_count(&RAYDIUM_AMM_V4_PROGRAM_ID), 1);
    assert_eq!(connection.active_subscriptions(), 2);
    assert!(detector.is_running());

    detector.stop().await;
    detector.stop().await;
    assert!(!detector.is_running());
    assert_eq!(connection.active_subscriptions(), 0);

    // Le cycle reste réutilisable après un arrêt complet.
    detector.start().await.unwrap();
    assert!(detector.is_running());
    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_failure_on_one_exchange_does_not_block_the_others() {
    let transport = Arc::new(MockTransport::new());
    let raydium = profile_for(DexKind::RaydiumAmmV4);
    let pump = profile_for(DexKind::PumpAmm);

    // Tout abonnement Raydium échoue à l'établissement : le scan périodique
    // doit couvrir ce programme pendant que Pump.fun reste en push.
    transport.fail_subscriptions_for(RAYDIUM_AMM_V4_PROGRAM_ID);

    let raydium_pool = Pubkey::new_unique();
    let raydium_data = synthetic_pool(&raydium, &Pubkey::new_unique(), &Pubkey::new_unique());
    transport.set_program_accounts(RAYDIUM_AMM_V4_PROGRAM_ID, vec![(raydium_pool, raydium_data)]);

    let pump_pool = Pubkey::new_unique();
    let pump_data = synthetic_pool(&pump, &Pubkey::new_unique(), &Pubkey::new_unique());

    let (detector, mut events, _) = detector_with(transport.clone(), vec![raydium, pump]);
    detector.start().await.unwrap();
    assert!(detector.is_running());

    transport
        .push_account_update(PUMP_AMM_PROGRAM_ID, pump_pool, pump_data)
        .await;

    let mut seen = Vec::new();
    seen.push(next_event(&mut events).await.pool);
    seen.push(next_event(&mut events).await.pool);
    seen.sort_by_key(|record| record.address);

    let mut expected = vec![
        (raydium_pool, DetectionSource::PeriodicScan),
        (pump_pool, DetectionSource::PushAccount),
    ];
    expected.sort_by_key(|(address, _)| *address);
    for (record, (address, source)) in seen.iter().zip(&expected) {
        assert_eq!(record.address, *address);
        assert_eq!(record.source, *source);
    }

    assert_eq!(detector.pool_count_by_dex(DexKind::RaydiumAmmV4), 1);
    assert_eq!(detector.pool_count_by_dex(DexKind::PumpAmm), 1);

    detector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn endpoint_failover_reopens_subscriptions_and_detection_continues() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::PumpAmm);
    let pool = Pubkey::new_unique();
    let data = synthetic_pool(&profile, &Pubkey::new_unique(), &Pubkey::new_unique());

    let (detector, mut events, connection) = detector_with(transport.clone(), vec![profile]);
    detector.start().await.unwrap();
    let before = transport.call_count("program_subscribe");

    // Deux health checks en échec : seuil de bascule atteint.
    transport.fail_op("get_slot", RpcError::transient("get_slot", "coupure"), 2);
    connection.health_check().await;
    connection.health_check().await;
    assert_eq!(connection.current_url(), "http://secours");

    // On laisse la boucle consommer le signal de reconnexion.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.call_count("program_subscribe") > before);

    // Les ré-abonnements visent bien l'endpoint de secours.
    let urls = transport.urls_for("program_subscribe");
    assert_eq!(urls.last().map(String::as_str), Some("http://secours"));

    transport
        .push_account_update(PUMP_AMM_PROGRAM_ID, pool, data)
        .await;
    let event = next_event(&mut events).await;
    assert_eq!(event.pool.address, pool);

    detector.stop().await;
}

struct FixedSnapshot(Vec<PoolRecord>);

#[async_trait]
impl PoolSnapshotSource for FixedSnapshot {
    async fn load_known_pools(&self) -> Result<Vec<PoolRecord>> {
        Ok(self.0.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn pools_reloaded_from_persistence_are_never_reannounced() {
    let transport = Arc::new(MockTransport::new());
    let profile = profile_for(DexKind::RaydiumAmmV4);
    let pool = Pubkey::new_unique();
    let base_mint = Pubkey::new_unique();
    let quote_mint = Pubkey::new_unique();
    let data = synthetic_pool(&profile, &base_mint, &quote_mint);
    transport.set_program_accounts(RAYDIUM_AMM_V4_PROGRAM_ID, vec![(pool, data)]);

    let known = PoolRecord {
        address: pool,
        exchange: DexKind::RaydiumAmmV4,
        base_mint,
        quote_mint,
        first_detected_ms: 1,
        last_updated_ms: 1,
        source: DetectionSource::PeriodicScan,
    };

    let connection = Arc::new(
        ConnectionManager::new(
            vec!["http://primaire".to_string()],
            transport.clone(),
            RetrySettings::default(),
        )
        .unwrap(),
    );
    let (detector, mut events) = PoolDetector::new(
        connection,
        DetectorConfig {
            profiles: vec![profile],
            scan_interval: SCAN_INTERVAL,
            event_queue_size: 64,
        },
        Some(Arc::new(FixedSnapshot(vec![known]))),
    );
    detector.start().await.unwrap();

    assert_eq!(detector.known_pools().len(), 1);
    assert_eq!(detector.monitored_tokens().len(), 2);

    // Le scan redécouvre le pool rechargé : silence attendu sur le flux.
    tokio::time::sleep(SCAN_INTERVAL * 3).await;
    expect_no_event(&mut events).await;

    detector.stop().await;
}
