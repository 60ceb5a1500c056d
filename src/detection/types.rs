// DANS : src/detection/types.rs

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Les exchanges supportés. Chaque variante correspond à un programme
/// on-chain et à une table d'heuristiques dans `profiles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DexKind {
    RaydiumAmmV4,
    PumpAmm,
    OrcaWhirlpool,
}

impl fmt::Display for DexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DexKind::RaydiumAmmV4 => "Raydium AMM V4",
            DexKind::PumpAmm => "Pump.fun AMM",
            DexKind::OrcaWhirlpool => "Orca Whirlpool",
        };
        f.write_str(name)
    }
}

/// Le canal de détection par lequel un pool a été vu en premier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionSource {
    PushAccount,
    PushLog,
    PeriodicScan,
}

/// Un pool confirmé, identifié par son adresse on-chain. Une fois inséré
/// dans le jeu de pools connus, seul `last_updated_ms` évolue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub address: Pubkey,
    pub exchange: DexKind,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
    pub first_detected_ms: i64,
    pub last_updated_ms: i64,
    pub source: DetectionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionEventKind {
    NewPool,
}

/// L'événement émis vers les collaborateurs externes (risque, stratégie,
/// exécution). Valeur immuable : le cœur ne garde aucune référence vers
/// ses consommateurs.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub kind: DetectionEventKind,
    pub pool: PoolRecord,
    pub timestamp_ms: i64,
}

impl DetectionEvent {
    pub fn new_pool(pool: PoolRecord) -> Self {
        Self {
            kind: DetectionEventKind::NewPool,
            timestamp_ms: pool.first_detected_ms,
            pool,
        }
    }
}

/// Le flux léger pour les écouteurs qui n'ont pas besoin du PoolRecord complet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    NewPoolDetected,
    EndpointFailover,
    RpcUnhealthy,
}

#[derive(Debug, Clone, Copy)]
pub struct Notice {
    pub kind: NoticeKind,
    pub timestamp_ms: i64,
}

impl Notice {
    pub fn now(kind: NoticeKind) -> Self {
        Self { kind, timestamp_ms: now_ms() }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
