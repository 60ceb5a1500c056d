// DANS : src/rpc/connection_manager.rs

use crate::rpc::{
    error::RpcError,
    registry::{SubscriptionKind, SubscriptionRegistry},
    transport::{AccountUpdate, LogsUpdate, ProgramAccountFilter, RpcTransport},
};
use anyhow::{Result, ensure};
use solana_sdk::{account::Account, pubkey::Pubkey, signature::Signature};
use std::{
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{sync::mpsc, sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

/// L'état d'un endpoint RPC configuré. Exactement un endpoint porte
/// `is_current = true` à tout instant.
#[derive(Debug, Clone)]
pub struct EndpointState {
    pub url: String,
    pub consecutive_failures: u32,
    pub last_health_check_ms: i64,
    pub is_current: bool,
}

/// Santé globale de la connexion, publiée pour l'outillage opérationnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    /// La bascule a fait le tour de tous les endpoints sans qu'aucune sonde
    /// ne réussisse entre-temps. On continue de sonder, mais les
    /// collaborateurs doivent alerter.
    AllEndpointsFailing,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Nombre total de tentatives pour un appel (pas de tentatives "en plus").
    pub max_retries: u32,
    /// Délai entre la tentative i et i+1 : `base_delay × i` (backoff linéaire).
    pub base_delay: Duration,
    /// Échecs de sonde consécutifs avant bascule d'endpoint.
    pub failover_threshold: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2_000),
            failover_threshold: 3,
        }
    }
}

/// Le gestionnaire de connexion : une interface d'appel/abonnement uniforme
/// au-dessus d'un ou plusieurs endpoints RPC, avec ré-essai borné, sonde de
/// santé et bascule automatique vers les endpoints de secours.
///
/// Il ne recrée jamais de lui-même les abonnements après une bascule : il
/// publie un signal `reconnect` et c'est le propriétaire des abonnements
/// (l'orchestrateur) qui les ré-émet.
pub struct ConnectionManager {
    transport: Arc<dyn RpcTransport>,
    endpoints: RwLock<Vec<EndpointState>>,
    settings: RetrySettings,
    registry: SubscriptionRegistry,
    consecutive_failovers: AtomicU32,
    reconnect_tx: watch::Sender<u64>,
    health_tx: watch::Sender<ConnectionHealth>,
}

impl ConnectionManager {
    pub fn new(
        urls: Vec<String>,
        transport: Arc<dyn RpcTransport>,
        settings: RetrySettings,
    ) -> Result<Self> {
        ensure!(!urls.is_empty(), "au moins un endpoint RPC est requis");
        ensure!(settings.max_retries >= 1, "max_retries doit être au moins 1");

        let endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| EndpointState {
                url,
                consecutive_failures: 0,
                last_health_check_ms: 0,
                is_current: i == 0,
            })
            .collect();

        let (reconnect_tx, _) = watch::channel(0u64);
        let (health_tx, _) = watch::channel(ConnectionHealth::Healthy);

        Ok(Self {
            transport,
            endpoints: RwLock::new(endpoints),
            settings,
            registry: SubscriptionRegistry::new(),
            consecutive_failovers: AtomicU32::new(0),
            reconnect_tx,
            health_tx,
        })
    }

    /// L'URL de l'endpoint courant.
    pub fn current_url(&self) -> String {
        let endpoints = self.endpoints.read().unwrap();
        endpoints
            .iter()
            .find(|e| e.is_current)
            .map(|e| e.url.clone())
            .unwrap_or_else(|| endpoints[0].url.clone())
    }

    /// Un instantané de l'état de tous les endpoints.
    pub fn endpoint_states(&self) -> Vec<EndpointState> {
        self.endpoints.read().unwrap().clone()
    }

    /// Signal de reconnexion : la valeur change à chaque bascule d'endpoint.
    pub fn reconnect_signal(&self) -> watch::Receiver<u64> {
        self.reconnect_tx.subscribe()
    }

    pub fn health_signal(&self) -> watch::Receiver<ConnectionHealth> {
        self.health_tx.subscribe()
    }

    /// Exécute une opération avec la politique de ré-essai : exactement
    /// `max_retries` tentatives, backoff linéaire, et la dernière erreur est
    /// retournée telle quelle. Les erreurs permanentes ne sont jamais
    /// ré-essayées.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, RpcError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max = self.settings.max_retries;
        for attempt in 1..=max {
            let url = self.current_url();
            match f(url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.settings.base_delay * attempt;
                    warn!(
                        op,
                        attempt,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "appel RPC en échec transitoire, nouvelle tentative"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!()
    }

    // --- APPELS WRAPPÉS ---

    pub async fn get_account(&self, address: &Pubkey) -> Result<Account, RpcError> {
        let transport = self.transport.clone();
        let address = *address;
        self.with_retry("get_account", move |url| {
            let transport = transport.clone();
            async move { transport.get_account(&url, &address).await }
        })
        .await
    }

    pub async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, RpcError> {
        let transport = self.transport.clone();
        let addresses = addresses.to_vec();
        self.with_retry("get_multiple_accounts", move |url| {
            let transport = transport.clone();
            let addresses = addresses.clone();
            async move { transport.get_multiple_accounts(&url, &addresses).await }
        })
        .await
    }

    pub async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filter: ProgramAccountFilter,
    ) -> Result<Vec<(Pubkey, Account)>, RpcError> {
        let transport = self.transport.clone();
        let program = *program;
        self.with_retry("get_program_accounts", move |url| {
            let transport = transport.clone();
            async move { transport.get_program_accounts(&url, &program, filter).await }
        })
        .await
    }

    pub async fn get_transaction_accounts(
        &self,
        signature: &Signature,
    ) -> Result<Vec<Pubkey>, RpcError> {
        let transport = self.transport.clone();
        let signature = *signature;
        self.with_retry("get_transaction_accounts", move |url| {
            let transport = transport.clone();
            async move { transport.get_transaction_accounts(&url, &signature).await }
        })
        .await
    }

    // --- SANTÉ ET BASCULE ---

    /// Sonde l'endpoint courant (sans ré-essai : c'est la répétition des
    /// sondes qui mesure la santé, pas leur entêtement). Atteindre le seuil
    /// d'échecs consécutifs déclenche exactement une bascule.
    pub async fn health_check(&self) -> bool {
        let url = self.current_url();
        let healthy = self.transport.get_slot(&url).await.is_ok();
        let now = unix_ms();

        if healthy {
            let mut endpoints = self.endpoints.write().unwrap();
            if let Some(endpoint) = endpoints.iter_mut().find(|e| e.is_current) {
                endpoint.consecutive_failures = 0;
                endpoint.last_health_check_ms = now;
            }
            drop(endpoints);
            self.consecutive_failovers.store(0, Ordering::SeqCst);
            self.publish_health(ConnectionHealth::Healthy);
            return true;
        }

        let should_failover = {
            let mut endpoints = self.endpoints.write().unwrap();
            match endpoints.iter_mut().find(|e| e.is_current) {
                Some(endpoint) => {
                    endpoint.consecutive_failures += 1;
                    endpoint.last_health_check_ms = now;
                    debug!(
                        url = %endpoint.url,
                        failures = endpoint.consecutive_failures,
                        "échec de la sonde de santé"
                    );
                    endpoint.consecutive_failures >= self.settings.failover_threshold
                }
                None => false,
            }
        };

        if should_failover {
            self.failover();
        }
        false
    }

    /// Bascule `is_current` vers l'endpoint suivant dans l'ordre configuré
    /// (avec retour au début), puis signale la reconnexion.
    fn failover(&self) {
        let endpoint_count;
        let (from, to) = {
            let mut endpoints = self.endpoints.write().unwrap();
            endpoint_count = endpoints.len();
            let current = endpoints.iter().position(|e| e.is_current).unwrap_or(0);
            let next = (current + 1) % endpoints.len();
            endpoints[current].is_current = false;
            endpoints[current].consecutive_failures = 0;
            endpoints[next].is_current = true;
            endpoints[next].consecutive_failures = 0;
            (endpoints[current].url.clone(), endpoints[next].url.clone())
        };
        warn!(from = %from, to = %to, "bascule d'endpoint RPC");

        let failovers = self.consecutive_failovers.fetch_add(1, Ordering::SeqCst) + 1;
        if failovers as usize >= endpoint_count {
            error!("tous les endpoints RPC configurés sont en échec");
            self.publish_health(ConnectionHealth::AllEndpointsFailing);
        }

        self.reconnect_tx.send_modify(|generation| *generation += 1);
    }

    fn publish_health(&self, health: ConnectionHealth) {
        if *self.health_tx.borrow() != health {
            let _ = self.health_tx.send(health);
        }
    }

    /// Démarre la boucle de sonde de santé en tâche de fond.
    pub fn start_health_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        info!(interval_ms = interval.as_millis() as u64, "démarrage de la boucle de santé RPC");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.health_check().await;
            }
        })
    }

    // --- ABONNEMENTS ---

    /// Ouvre un abonnement aux changements de comptes d'un programme et
    /// retourne son handle. La livraison est asynchrone et non ordonnée par
    /// rapport aux autres abonnements.
    pub async fn subscribe_account_changes(
        &self,
        program: &Pubkey,
        filter: ProgramAccountFilter,
        sender: mpsc::Sender<AccountUpdate>,
    ) -> Result<u64, RpcError> {
        let id = self.registry.register(SubscriptionKind::AccountChange, *program);
        let url = self.current_url();
        match self
            .transport
            .subscribe_program_accounts(&url, program, filter, sender)
            .await
        {
            Ok(subscription) => {
                self.registry.activate(id, subscription);
                Ok(id)
            }
            Err(e) => {
                self.registry.mark_failed(id);
                Err(e)
            }
        }
    }

    /// Ouvre un abonnement aux logs mentionnant un programme.
    pub async fn subscribe_program_logs(
        &self,
        program: &Pubkey,
        sender: mpsc::Sender<LogsUpdate>,
    ) -> Result<u64, RpcError> {
        let id = self.registry.register(SubscriptionKind::LogStream, *program);
        let url = self.current_url();
        match self.transport.subscribe_program_logs(&url, program, sender).await {
            Ok(subscription) => {
                self.registry.activate(id, subscription);
                Ok(id)
            }
            Err(e) => {
                self.registry.mark_failed(id);
                Err(e)
            }
        }
    }

    /// Annule un abonnement. Idempotent : `false` pour un handle inconnu ou
    /// déjà annulé.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry.cancel(id)
    }

    pub fn unsubscribe_all(&self) {
        self.registry.cancel_all();
    }

    /// Le nombre d'abonnements actuellement actifs (diagnostic et tests).
    pub fn active_subscriptions(&self) -> usize {
        self.registry.active_count()
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
