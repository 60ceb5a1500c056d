// DANS : src/detection/orchestrator.rs

use crate::detection::{
    classifier::{PoolCandidate, classify, matches_creation_logs},
    profiles::ExchangeProfile,
    types::{
        DetectionEvent, DetectionSource, DexKind, Notice, NoticeKind, PoolRecord, now_ms,
    },
};
use crate::rpc::{
    connection_manager::{ConnectionHealth, ConnectionManager},
    transport::{AccountUpdate, LogsUpdate, ProgramAccountFilter},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Plafond du backoff du scan périodique quand le RPC est dégradé :
/// l'intervalle effectif ne dépasse jamais `scan_interval × 8`.
const MAX_SCAN_BACKOFF: u32 = 8;

/// Le collaborateur de persistance, lu une seule fois au démarrage pour
/// recharger le jeu de pools déjà connus. Le cœur n'écrit jamais dedans.
#[async_trait]
pub trait PoolSnapshotSource: Send + Sync {
    async fn load_known_pools(&self) -> Result<Vec<PoolRecord>>;
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub profiles: Vec<ExchangeProfile>,
    pub scan_interval: Duration,
    pub event_queue_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            profiles: crate::detection::profiles::default_profiles(),
            scan_interval: Duration::from_millis(5_000),
            event_queue_size: 1_024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Ce que les tâches détachées (scan, récupération de transaction)
/// renvoient dans la boucle. Toute insertion dans le jeu de pools connus
/// passe par la boucle : la déduplication n'a qu'un seul site.
#[derive(Debug)]
enum LoopFeedback {
    Candidates {
        exchange: DexKind,
        source: DetectionSource,
        accounts: Vec<(Pubkey, Vec<u8>)>,
    },
    ScanFinished {
        ok: bool,
    },
}

struct DetectorRuntime {
    loop_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    subscriptions: Option<Arc<Mutex<Vec<u64>>>>,
}

/// L'orchestrateur de détection de pools.
///
/// Pour chaque programme d'exchange activé, il ouvre deux canaux push
/// complémentaires (changements de comptes et logs), normalise les deux en
/// candidats, déduplique par adresse contre le jeu de pools connus, et se
/// rattrape par un scan périodique complet : avec un intervalle T, un pool
/// raté par les canaux push est détecté au plus T après sa création.
///
/// Instance construite explicitement et injectée : pas de singleton global,
/// plusieurs détecteurs indépendants peuvent coexister (tests d'intégration).
pub struct PoolDetector {
    connection: Arc<ConnectionManager>,
    config: DetectorConfig,
    snapshot_source: Option<Arc<dyn PoolSnapshotSource>>,
    state: RwLock<DetectorState>,
    /// Snapshot immuable du jeu de pools connus : la boucle écrit, les
    /// lecteurs externes lisent sans jamais toucher la structure vivante.
    known: Arc<ArcSwap<HashMap<Pubkey, PoolRecord>>>,
    events_tx: mpsc::Sender<DetectionEvent>,
    notices_tx: broadcast::Sender<Notice>,
    running: Arc<AtomicBool>,
    runtime: Mutex<DetectorRuntime>,
}

impl PoolDetector {
    /// Construit le détecteur et retourne le récepteur des événements de
    /// détection. Le détecteur ne garde aucune référence vers ses consommateurs.
    pub fn new(
        connection: Arc<ConnectionManager>,
        config: DetectorConfig,
        snapshot_source: Option<Arc<dyn PoolSnapshotSource>>,
    ) -> (Self, mpsc::Receiver<DetectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_size.max(1));
        let (notices_tx, _) = broadcast::channel(64);
        let detector = Self {
            connection,
            config,
            snapshot_source,
            state: RwLock::new(DetectorState::Stopped),
            known: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            events_tx,
            notices_tx,
            running: Arc::new(AtomicBool::new(false)),
            runtime: Mutex::new(DetectorRuntime {
                loop_handle: None,
                shutdown_tx: None,
                subscriptions: None,
            }),
        };
        (detector, events_rx)
    }

    // --- CYCLE DE VIE ---

    /// Démarre la détection. Idempotent : un appel redondant est ignoré.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                DetectorState::Running | DetectorState::Starting => {
                    info!("détecteur déjà démarré, appel ignoré");
                    return Ok(());
                }
                DetectorState::Stopping => {
                    warn!("démarrage demandé pendant l'arrêt, appel ignoré");
                    return Ok(());
                }
                DetectorState::Stopped => *state = DetectorState::Starting,
            }
        }
        info!(
            exchanges = self.config.profiles.iter().filter(|p| p.enabled).count(),
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            "démarrage du détecteur de pools"
        );

        // 1. Recharge du jeu de pools connus depuis la persistance externe.
        let mut pools: HashMap<Pubkey, PoolRecord> = HashMap::new();
        if let Some(source) = &self.snapshot_source {
            match source.load_known_pools().await {
                Ok(records) => {
                    for record in records {
                        pools.insert(record.address, record);
                    }
                    info!(count = pools.len(), "pools connus rechargés");
                }
                Err(e) => {
                    warn!(error = %e, "rechargement des pools connus impossible, démarrage à vide");
                }
            }
        }
        self.known.store(Arc::new(pools.clone()));

        let (account_tx, account_rx) = mpsc::channel(1_024);
        let (logs_tx, logs_rx) = mpsc::channel(1_024);
        let (feedback_tx, feedback_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // 2. Ouverture des deux canaux push par programme activé. Un échec
        //    sur un programme n'empêche pas les autres de démarrer.
        let handles =
            open_subscriptions(&self.connection, &self.config.profiles, &account_tx, &logs_tx)
                .await;
        let subscriptions = Arc::new(Mutex::new(handles));

        self.running.store(true, Ordering::SeqCst);

        // 3. La boucle unique : callbacks, résultats de scan, timer et
        //    signaux s'y entrelacent sans jamais s'exécuter en parallèle.
        let detector_loop = DetectorLoop {
            connection: self.connection.clone(),
            profiles: Arc::new(self.config.profiles.clone()),
            scan_interval: self.config.scan_interval,
            pools,
            snapshot: self.known.clone(),
            events_tx: self.events_tx.clone(),
            notices_tx: self.notices_tx.clone(),
            running: self.running.clone(),
            subscriptions: subscriptions.clone(),
            account_tx,
            logs_tx,
            feedback_tx,
            account_rx,
            logs_rx,
            feedback_rx,
            shutdown_rx,
            reconnect_rx: self.connection.reconnect_signal(),
            health_rx: self.connection.health_signal(),
            scan_in_flight: false,
            scan_backoff: 1,
        };
        let loop_handle = tokio::spawn(detector_loop.run());

        {
            let mut runtime = self.runtime.lock().await;
            runtime.loop_handle = Some(loop_handle);
            runtime.shutdown_tx = Some(shutdown_tx);
            runtime.subscriptions = Some(subscriptions);
        }
        *self.state.write().unwrap() = DetectorState::Running;
        info!("détecteur de pools en fonctionnement");
        Ok(())
    }

    /// Arrête la détection. Idempotent et best-effort : les erreurs de
    /// démontage sont loguées mais n'empêchent jamais le passage à Stopped.
    ///
    /// L'ordre compte : le timer vit dans la boucle, on termine donc la
    /// boucle d'abord (plus aucun scan ne peut partir), puis seulement les
    /// abonnements.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                DetectorState::Stopped | DetectorState::Stopping => {
                    info!("détecteur déjà arrêté, appel ignoré");
                    return;
                }
                _ => *state = DetectorState::Stopping,
            }
        }
        info!("arrêt du détecteur de pools");
        self.running.store(false, Ordering::SeqCst);

        let (loop_handle, shutdown_tx, subscriptions) = {
            let mut runtime = self.runtime.lock().await;
            (
                runtime.loop_handle.take(),
                runtime.shutdown_tx.take(),
                runtime.subscriptions.take(),
            )
        };

        if let Some(shutdown_tx) = &shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = loop_handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "la boucle de détection s'est terminée anormalement");
        }

        if let Some(subscriptions) = subscriptions {
            let mut handles = subscriptions.lock().await;
            for id in handles.drain(..) {
                self.connection.unsubscribe(id);
            }
        }

        *self.state.write().unwrap() = DetectorState::Stopped;
        info!("détecteur de pools arrêté");
    }

    pub fn is_running(&self) -> bool {
        *self.state.read().unwrap() == DetectorState::Running
    }

    // --- SURFACE DE LECTURE ---

    /// Une copie du jeu de pools connus, jamais la structure vivante.
    pub fn known_pools(&self) -> Vec<PoolRecord> {
        self.known.load().values().cloned().collect()
    }

    pub fn pool_count_by_dex(&self, exchange: DexKind) -> usize {
        self.known
            .load()
            .values()
            .filter(|record| record.exchange == exchange)
            .count()
    }

    /// L'union des adresses de tokens sur l'ensemble des pools connus.
    pub fn monitored_tokens(&self) -> Vec<Pubkey> {
        let mut tokens = HashSet::new();
        for record in self.known.load().values() {
            tokens.insert(record.base_mint);
            tokens.insert(record.quote_mint);
        }
        tokens.into_iter().collect()
    }

    /// Le flux léger d'événements pour l'outillage qui n'a pas besoin des records.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices_tx.subscribe()
    }
}

/// Ouvre les deux canaux push pour chaque programme activé. Un échec
/// d'établissement est logué sans bloquer les autres programmes : le scan
/// périodique couvre le programme orphelin.
async fn open_subscriptions(
    connection: &ConnectionManager,
    profiles: &[ExchangeProfile],
    account_tx: &mpsc::Sender<AccountUpdate>,
    logs_tx: &mpsc::Sender<LogsUpdate>,
) -> Vec<u64> {
    let mut handles = Vec::new();
    for profile in profiles.iter().filter(|p| p.enabled) {
        let filter = ProgramAccountFilter {
            data_len: Some(profile.pool_account_size as u64),
        };
        match connection
            .subscribe_account_changes(&profile.program_id, filter, account_tx.clone())
            .await
        {
            Ok(id) => handles.push(id),
            Err(e) => warn!(
                exchange = %profile.exchange,
                error = %e,
                "abonnement aux comptes impossible, le scan périodique couvrira ce programme"
            ),
        }
        match connection
            .subscribe_program_logs(&profile.program_id, logs_tx.clone())
            .await
        {
            Ok(id) => handles.push(id),
            Err(e) => warn!(
                exchange = %profile.exchange,
                error = %e,
                "abonnement aux logs impossible, le scan périodique couvrira ce programme"
            ),
        }
    }
    handles
}

/// L'état possédé par la boucle de détection. Le jeu de pools `pools` n'est
/// muté qu'ici ; chaque mutation publie un snapshot immuable.
struct DetectorLoop {
    connection: Arc<ConnectionManager>,
    profiles: Arc<Vec<ExchangeProfile>>,
    scan_interval: Duration,
    pools: HashMap<Pubkey, PoolRecord>,
    snapshot: Arc<ArcSwap<HashMap<Pubkey, PoolRecord>>>,
    events_tx: mpsc::Sender<DetectionEvent>,
    notices_tx: broadcast::Sender<Notice>,
    running: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<u64>>>,
    // Les émetteurs restent dans la boucle pour les ré-abonnements : les
    // canaux ne se ferment donc jamais tant que la boucle vit.
    account_tx: mpsc::Sender<AccountUpdate>,
    logs_tx: mpsc::Sender<LogsUpdate>,
    feedback_tx: mpsc::Sender<LoopFeedback>,
    account_rx: mpsc::Receiver<AccountUpdate>,
    logs_rx: mpsc::Receiver<LogsUpdate>,
    feedback_rx: mpsc::Receiver<LoopFeedback>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_rx: watch::Receiver<u64>,
    health_rx: watch::Receiver<ConnectionHealth>,
    scan_in_flight: bool,
    scan_backoff: u32,
}

impl DetectorLoop {
    async fn run(mut self) {
        let mut next_scan = Instant::now() + self.scan_interval;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => break,

                result = self.reconnect_rx.changed() => {
                    if result.is_ok() {
                        self.resubscribe().await;
                    }
                }

                result = self.health_rx.changed() => {
                    if result.is_ok()
                        && *self.health_rx.borrow_and_update() == ConnectionHealth::AllEndpointsFailing
                    {
                        error!("tous les endpoints RPC sont en échec, détection sur scans dégradés");
                        let _ = self.notices_tx.send(Notice::now(NoticeKind::RpcUnhealthy));
                    }
                }

                Some(update) = self.account_rx.recv() => {
                    self.handle_account_update(update);
                }

                Some(update) = self.logs_rx.recv() => {
                    self.handle_logs_update(update);
                }

                Some(feedback) = self.feedback_rx.recv() => {
                    // L'issue d'un scan recale l'échéance avec le backoff à
                    // jour, sans attendre le tick calculé avant le verdict.
                    if self.handle_feedback(feedback) {
                        next_scan = Instant::now() + self.scan_interval * self.scan_backoff;
                    }
                }

                _ = tokio::time::sleep_until(next_scan) => {
                    if self.scan_in_flight {
                        // Jamais mis en file : un tick raté est simplement perdu,
                        // le suivant rattrapera.
                        debug!("scan périodique encore en vol, tick ignoré");
                    } else {
                        self.scan_in_flight = true;
                        self.spawn_scan();
                    }
                    next_scan = Instant::now() + self.scan_interval * self.scan_backoff;
                }
            }
        }
        debug!("boucle de détection terminée");
    }

    fn profile_by_program(&self, program: &Pubkey) -> Option<&ExchangeProfile> {
        self.profiles
            .iter()
            .find(|p| p.enabled && p.program_id == *program)
    }

    fn profile_by_exchange(&self, exchange: DexKind) -> Option<&ExchangeProfile> {
        self.profiles.iter().find(|p| p.exchange == exchange)
    }

    // --- CANAL COMPTES ---

    fn handle_account_update(&mut self, update: AccountUpdate) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(profile) = self.profile_by_program(&update.program) else {
            return;
        };
        if let Some(candidate) = classify(&update.address, &update.data, profile) {
            let exchange = profile.exchange;
            if self.insert_or_touch(candidate, exchange, DetectionSource::PushAccount) {
                self.publish_snapshot();
            }
        }
    }

    // --- CANAL LOGS ---

    /// Un lot de logs qui matche les mots-clés de création déclenche la
    /// récupération de la transaction en tâche détachée ; ses comptes
    /// reviennent dans la boucle comme candidats. Les erreurs restent
    /// confinées à ce candidat.
    fn handle_logs_update(&self, update: LogsUpdate) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(profile) = self.profile_by_program(&update.program) else {
            return;
        };
        if !matches_creation_logs(&update.logs, profile) {
            return;
        }
        let signature = match Signature::from_str(&update.signature) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(signature = %update.signature, error = %e, "signature illisible dans les logs");
                return;
            }
        };
        debug!(
            exchange = %profile.exchange,
            signature = %signature,
            "mots-clés de création détectés, récupération de la transaction"
        );

        let connection = self.connection.clone();
        let feedback_tx = self.feedback_tx.clone();
        let running = self.running.clone();
        let program = update.program;
        let exchange = profile.exchange;
        tokio::spawn(async move {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let keys = match connection.get_transaction_accounts(&signature).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(signature = %signature, error = %e, "récupération de la transaction impossible");
                    return;
                }
            };
            let accounts = match connection.get_multiple_accounts(&keys).await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(signature = %signature, error = %e, "récupération des comptes impliqués impossible");
                    return;
                }
            };
            let owned: Vec<(Pubkey, Vec<u8>)> = keys
                .into_iter()
                .zip(accounts)
                .filter_map(|(address, account)| {
                    let account = account?;
                    (account.owner == program).then_some((address, account.data))
                })
                .collect();
            if owned.is_empty() {
                return;
            }
            let _ = feedback_tx
                .send(LoopFeedback::Candidates {
                    exchange,
                    source: DetectionSource::PushLog,
                    accounts: owned,
                })
                .await;
        });
    }

    // --- CANAL SCAN PÉRIODIQUE ---

    /// Énumère tous les comptes des programmes activés en tâche détachée.
    /// C'est le filet de sécurité : avec un intervalle T, un pool raté par
    /// les canaux push est détecté au plus T après sa création.
    fn spawn_scan(&self) {
        let connection = self.connection.clone();
        let profiles = self.profiles.clone();
        let feedback_tx = self.feedback_tx.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ok = true;
            for profile in profiles.iter().filter(|p| p.enabled) {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let filter = ProgramAccountFilter {
                    data_len: Some(profile.pool_account_size as u64),
                };
                match connection.get_program_accounts(&profile.program_id, filter).await {
                    Ok(accounts) => {
                        let accounts: Vec<(Pubkey, Vec<u8>)> = accounts
                            .into_iter()
                            .map(|(address, account)| (address, account.data))
                            .collect();
                        let _ = feedback_tx
                            .send(LoopFeedback::Candidates {
                                exchange: profile.exchange,
                                source: DetectionSource::PeriodicScan,
                                accounts,
                            })
                            .await;
                    }
                    Err(e) => {
                        ok = false;
                        warn!(exchange = %profile.exchange, error = %e, "échec du scan périodique");
                    }
                }
            }
            let _ = feedback_tx.send(LoopFeedback::ScanFinished { ok }).await;
        });
    }

    /// Retourne `true` quand l'issue d'un scan impose de recalculer la
    /// prochaine échéance (retour au rythme nominal ou backoff élargi).
    fn handle_feedback(&mut self, feedback: LoopFeedback) -> bool {
        match feedback {
            LoopFeedback::Candidates { exchange, source, accounts } => {
                if !self.running.load(Ordering::SeqCst) {
                    return false;
                }
                let Some(profile) = self.profile_by_exchange(exchange) else {
                    return false;
                };
                let profile = profile.clone();
                // Un scan rapporte tous les pools du programme à chaque tick :
                // le snapshot est publié une fois par lot, jamais par candidat.
                let mut changed = false;
                for (address, data) in accounts {
                    if let Some(candidate) = classify(&address, &data, &profile) {
                        changed |= self.insert_or_touch(candidate, exchange, source);
                    }
                }
                if changed {
                    self.publish_snapshot();
                }
                false
            }
            LoopFeedback::ScanFinished { ok } => {
                self.scan_in_flight = false;
                if ok {
                    let was_backed_off = self.scan_backoff > 1;
                    self.scan_backoff = 1;
                    was_backed_off
                } else {
                    self.scan_backoff = (self.scan_backoff * 2).min(MAX_SCAN_BACKOFF);
                    warn!(
                        backoff = self.scan_backoff,
                        "scan périodique en échec, prochain tick retardé"
                    );
                    true
                }
            }
        }
    }

    // --- DÉDUPLICATION ET ÉMISSION ---

    /// Le point unique d'insertion. La règle : la première découverte d'une
    /// adresse gagne le record et émet NEW_POOL ; toute redécouverte ne fait
    /// qu'avancer `last_updated_ms`, sans jamais ré-émettre.
    ///
    /// Ne publie pas de snapshot : c'est à l'appelant de le faire une fois
    /// son lot entier traité, la copie du jeu complet n'étant pas gratuite.
    fn insert_or_touch(
        &mut self,
        candidate: PoolCandidate,
        exchange: DexKind,
        source: DetectionSource,
    ) -> bool {
        let now = now_ms();
        if let Some(record) = self.pools.get_mut(&candidate.address) {
            record.last_updated_ms = now;
            return true;
        }

        let record = PoolRecord {
            address: candidate.address,
            exchange,
            base_mint: candidate.base_mint,
            quote_mint: candidate.quote_mint,
            first_detected_ms: now,
            last_updated_ms: now,
            source,
        };
        info!(
            pool = %record.address,
            exchange = %exchange,
            source = ?source,
            base_mint = %record.base_mint,
            quote_mint = %record.quote_mint,
            "nouveau pool détecté"
        );
        self.pools.insert(record.address, record.clone());

        if let Err(e) = self.events_tx.try_send(DetectionEvent::new_pool(record)) {
            warn!(error = %e, "file d'événements saturée, événement NewPool perdu");
        }
        let _ = self.notices_tx.send(Notice::now(NoticeKind::NewPoolDetected));
        true
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(self.pools.clone()));
    }

    // --- RECONNEXION ---

    /// Après une bascule d'endpoint, le gestionnaire de connexion ne recrée
    /// pas les abonnements de lui-même : c'est ici qu'on les ré-émet.
    async fn resubscribe(&self) {
        info!("bascule d'endpoint signalée, réouverture des abonnements");
        let _ = self.notices_tx.send(Notice::now(NoticeKind::EndpointFailover));

        let mut handles = self.subscriptions.lock().await;
        for id in handles.drain(..) {
            self.connection.unsubscribe(id);
        }
        let reopened =
            open_subscriptions(&self.connection, &self.profiles, &self.account_tx, &self.logs_tx)
                .await;
        handles.extend(reopened);
    }
}
