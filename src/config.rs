use anyhow::Result;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Config {
    /// L'endpoint RPC principal.
    pub solana_rpc_url: String,

    /// Les endpoints de secours, dans l'ordre de bascule (liste séparée par des virgules).
    #[serde(default)]
    pub backup_rpc_urls: Vec<String>,

    /// Nombre total de tentatives pour un appel RPC.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Délai de base entre deux tentatives ; le délai réel est `base × numéro de tentative`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Nombre d'échecs de health check consécutifs avant bascule d'endpoint.
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Intervalle du scan périodique de rattrapage.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Taille de la file d'événements de détection sortants.
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    /// Chemin optionnel vers un fichier JSON de tables d'heuristiques par exchange.
    /// Sans lui, les tables intégrées sont utilisées.
    #[serde(default)]
    pub exchange_profiles_path: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2_000
}
fn default_failover_threshold() -> u32 {
    3
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_scan_interval_ms() -> u64 {
    5_000
}
fn default_event_queue_size() -> usize {
    1_024
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()?;
        Ok(config)
    }

    /// L'endpoint principal suivi des endpoints de secours, dans l'ordre de bascule.
    pub fn endpoints(&self) -> Vec<String> {
        std::iter::once(self.solana_rpc_url.clone())
            .chain(self.backup_rpc_urls.iter().cloned())
            .collect()
    }
}
