// DANS : src/rpc/registry.rs

use crate::rpc::transport::TransportSubscription;
use solana_sdk::pubkey::Pubkey;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    AccountChange,
    LogStream,
}

/// Cycle de vie d'un abonnement : Pending à l'enregistrement, Active une
/// fois le handle transport obtenu, Failed si l'établissement échoue
/// (jamais devenu actif), Cancelled sur désabonnement explicite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Cancelled,
    Failed,
}

#[derive(Debug)]
struct Subscription {
    kind: SubscriptionKind,
    target: Pubkey,
    registered_at_ms: i64,
    state: SubscriptionState,
    // La tâche transport qui lit le stream ; la couper est le désabonnement.
    transport: Option<TransportSubscription>,
}

/// Le registre des abonnements push. Il est le seul propriétaire des objets
/// d'abonnement : les appelants ne détiennent que le handle numérique.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un abonnement en état Pending et retourne son handle.
    pub fn register(&self, kind: SubscriptionKind, target: Pubkey) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            Subscription {
                kind,
                target,
                registered_at_ms: unix_ms(),
                state: SubscriptionState::Pending,
                transport: None,
            },
        );
        id
    }

    /// Passe un abonnement Pending en Active en lui attachant sa tâche transport.
    pub fn activate(&self, id: u64, transport: TransportSubscription) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id)
            && entry.state == SubscriptionState::Pending
        {
            entry.transport = Some(transport);
            entry.state = SubscriptionState::Active;
            debug!(id, target = %entry.target, kind = ?entry.kind, "abonnement actif");
        }
    }

    /// Marque un abonnement dont l'établissement a échoué. Il ne sera jamais actif.
    pub fn mark_failed(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&id)
            && entry.state == SubscriptionState::Pending
        {
            entry.state = SubscriptionState::Failed;
        }
    }

    /// Annule un abonnement. Idempotent : un handle inconnu, déjà annulé ou
    /// en échec retourne `false` au lieu d'échouer.
    pub fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        match entry.state {
            SubscriptionState::Cancelled | SubscriptionState::Failed => false,
            SubscriptionState::Pending | SubscriptionState::Active => {
                if let Some(transport) = entry.transport.take() {
                    transport.abort();
                }
                entry.state = SubscriptionState::Cancelled;
                debug!(id, target = %entry.target, "abonnement annulé");
                true
            }
        }
    }

    /// Annule tous les abonnements encore vivants.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner.entries.keys().copied().collect()
        };
        for id in ids {
            self.cancel(id);
        }
    }

    pub fn state_of(&self, id: u64) -> Option<SubscriptionState> {
        self.inner.lock().unwrap().entries.get(&id).map(|e| e.state)
    }

    /// Le nombre d'abonnements actuellement actifs.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.state == SubscriptionState::Active)
            .count()
    }

    pub fn registered_at_ms(&self, id: u64) -> Option<i64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .map(|e| e.registered_at_ms)
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_transport() -> TransportSubscription {
        TransportSubscription::new(tokio::spawn(std::future::pending::<()>()))
    }

    #[tokio::test]
    async fn lifecycle_pending_active_cancelled() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(SubscriptionKind::AccountChange, Pubkey::new_unique());
        assert_eq!(registry.state_of(id), Some(SubscriptionState::Pending));
        assert!(registry.registered_at_ms(id).is_some_and(|t| t > 0));
        assert_eq!(registry.registered_at_ms(9_999), None);

        registry.activate(id, dummy_transport());
        assert_eq!(registry.state_of(id), Some(SubscriptionState::Active));
        assert_eq!(registry.active_count(), 1);

        assert!(registry.cancel(id));
        assert_eq!(registry.state_of(id), Some(SubscriptionState::Cancelled));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(SubscriptionKind::LogStream, Pubkey::new_unique());
        registry.activate(id, dummy_transport());

        assert!(registry.cancel(id));
        assert!(!registry.cancel(id));
        assert!(!registry.cancel(9_999));
    }

    #[tokio::test]
    async fn failed_setup_never_becomes_active() {
        let registry = SubscriptionRegistry::new();
        let id = registry.register(SubscriptionKind::AccountChange, Pubkey::new_unique());
        registry.mark_failed(id);
        assert_eq!(registry.state_of(id), Some(SubscriptionState::Failed));

        // Annuler un abonnement en échec est un non-événement.
        assert!(!registry.cancel(id));
        assert_eq!(registry.state_of(id), Some(SubscriptionState::Failed));
    }

    #[tokio::test]
    async fn cancel_all_sweeps_everything() {
        let registry = SubscriptionRegistry::new();
        for _ in 0..3 {
            let id = registry.register(SubscriptionKind::AccountChange, Pubkey::new_unique());
            registry.activate(id, dummy_transport());
        }
        registry.cancel_all();
        assert_eq!(registry.active_count(), 0);
    }
}
