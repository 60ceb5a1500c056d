// DANS : src/rpc/mock.rs
//
// Transport simulé pour les tests : résultats programmables, compteurs
// d'appels, et canaux d'abonnement retenus pour injecter des notifications
// push. Exposé derrière la feature `testkit` pour les tests d'intégration.

use crate::rpc::{
    error::RpcError,
    transport::{
        AccountUpdate, LogsUpdate, ProgramAccountFilter, RpcTransport, TransportSubscription,
    },
};
use async_trait::async_trait;
use solana_sdk::{account::Account, pubkey::Pubkey, signature::Signature};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    accounts: HashMap<Pubkey, Account>,
    program_accounts: HashMap<Pubkey, Vec<(Pubkey, Account)>>,
    transactions: HashMap<Signature, Vec<Pubkey>>,
    /// Erreurs à servir avant les succès, par opération.
    failures: HashMap<&'static str, VecDeque<RpcError>>,
    /// Programmes dont l'établissement d'abonnement doit échouer.
    subscribe_failures: HashSet<Pubkey>,
    /// Journal (opération, URL) de chaque appel reçu.
    calls: Vec<(&'static str, String)>,
    account_senders: Vec<(Pubkey, mpsc::Sender<AccountUpdate>)>,
    logs_senders: Vec<(Pubkey, mpsc::Sender<LogsUpdate>)>,
    slot: u64,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // --- PROGRAMMATION DU SCÉNARIO ---

    pub fn set_account(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        let account = account_with(owner, data);
        self.state.lock().unwrap().accounts.insert(address, account);
    }

    pub fn set_program_accounts(&self, program: Pubkey, accounts: Vec<(Pubkey, Vec<u8>)>) {
        let accounts = accounts
            .into_iter()
            .map(|(address, data)| (address, account_with(program, data)))
            .collect();
        self.state
            .lock()
            .unwrap()
            .program_accounts
            .insert(program, accounts);
    }

    pub fn set_transaction_accounts(&self, signature: Signature, accounts: Vec<Pubkey>) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(signature, accounts);
    }

    /// Fait échouer les `times` prochains appels de `op` avec `error`.
    pub fn fail_op(&self, op: &'static str, error: RpcError, times: u32) {
        let mut state = self.state.lock().unwrap();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fait échouer tout établissement d'abonnement visant ce programme.
    pub fn fail_subscriptions_for(&self, program: Pubkey) {
        self.state.lock().unwrap().subscribe_failures.insert(program);
    }

    // --- INJECTION DE NOTIFICATIONS PUSH ---

    /// Livre une notification de changement de compte à tous les abonnements
    /// ouverts sur ce programme.
    pub async fn push_account_update(&self, program: Pubkey, address: Pubkey, data: Vec<u8>) {
        let senders: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .account_senders
                .iter()
                .filter(|(p, _)| *p == program)
                .map(|(_, sender)| sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender
                .send(AccountUpdate { program, address, data: data.clone() })
                .await;
        }
    }

    /// Livre un lot de lignes de log à tous les abonnements logs de ce programme.
    pub async fn push_logs(&self, program: Pubkey, signature: &Signature, logs: Vec<String>) {
        let senders: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .logs_senders
                .iter()
                .filter(|(p, _)| *p == program)
                .map(|(_, sender)| sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender
                .send(LogsUpdate {
                    program,
                    signature: signature.to_string(),
                    logs: logs.clone(),
                })
                .await;
        }
    }

    // --- OBSERVATION ---

    pub fn call_count(&self, op: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .count() as u32
    }

    /// Les URLs vues pour une opération, dans l'ordre des appels.
    pub fn urls_for(&self, op: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, url)| url.clone())
            .collect()
    }

    pub fn account_subscription_count(&self, program: &Pubkey) -> usize {
        self.state
            .lock()
            .unwrap()
            .account_senders
            .iter()
            .filter(|(p, _)| p == program)
            .count()
    }

    pub fn logs_subscription_count(&self, program: &Pubkey) -> usize {
        self.state
            .lock()
            .unwrap()
            .logs_senders
            .iter()
            .filter(|(p, _)| p == program)
            .count()
    }

    fn record(&self, op: &'static str, url: &str) {
        self.state.lock().unwrap().calls.push((op, url.to_string()));
    }

    fn take_failure(&self, op: &str) -> Option<RpcError> {
        self.state
            .lock()
            .unwrap()
            .failures
            .get_mut(op)
            .and_then(|queue| queue.pop_front())
    }

    fn idle_subscription() -> TransportSubscription {
        TransportSubscription::new(tokio::spawn(std::future::pending::<()>()))
    }
}

fn account_with(owner: Pubkey, data: Vec<u8>) -> Account {
    Account {
        lamports: 1,
        data,
        owner,
        executable: false,
        rent_epoch: 0,
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn get_account(&self, url: &str, address: &Pubkey) -> Result<Account, RpcError> {
        self.record("get_account", url);
        if let Some(e) = self.take_failure("get_account") {
            return Err(e);
        }
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(address)
            .cloned()
            .ok_or_else(|| RpcError::permanent("get_account", format!("compte inconnu: {address}")))
    }

    async fn get_multiple_accounts(
        &self,
        url: &str,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, RpcError> {
        self.record("get_multiple_accounts", url);
        if let Some(e) = self.take_failure("get_multiple_accounts") {
            return Err(e);
        }
        let state = self.state.lock().unwrap();
        Ok(addresses
            .iter()
            .map(|address| state.accounts.get(address).cloned())
            .collect())
    }

    async fn get_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        filter: ProgramAccountFilter,
    ) -> Result<Vec<(Pubkey, Account)>, RpcError> {
        self.record("get_program_accounts", url);
        if let Some(e) = self.take_failure("get_program_accounts") {
            return Err(e);
        }
        let state = self.state.lock().unwrap();
        let accounts = state
            .program_accounts
            .get(program)
            .cloned()
            .unwrap_or_default();
        Ok(accounts
            .into_iter()
            .filter(|(_, account)| match filter.data_len {
                Some(n) => account.data.len() as u64 == n,
                None => true,
            })
            .collect())
    }

    async fn get_transaction_accounts(
        &self,
        url: &str,
        signature: &Signature,
    ) -> Result<Vec<Pubkey>, RpcError> {
        self.record("get_transaction", url);
        if let Some(e) = self.take_failure("get_transaction") {
            return Err(e);
        }
        self.state
            .lock()
            .unwrap()
            .transactions
            .get(signature)
            .cloned()
            .ok_or_else(|| {
                RpcError::permanent("get_transaction", format!("transaction inconnue: {signature}"))
            })
    }

    async fn get_slot(&self, url: &str) -> Result<u64, RpcError> {
        self.record("get_slot", url);
        if let Some(e) = self.take_failure("get_slot") {
            return Err(e);
        }
        let mut state = self.state.lock().unwrap();
        state.slot += 1;
        Ok(state.slot)
    }

    async fn subscribe_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        _filter: ProgramAccountFilter,
        sender: mpsc::Sender<AccountUpdate>,
    ) -> Result<TransportSubscription, RpcError> {
        self.record("program_subscribe", url);
        let mut state = self.state.lock().unwrap();
        if state.subscribe_failures.contains(program) {
            return Err(RpcError::transient(
                "program_subscribe",
                "établissement refusé par le scénario de test",
            ));
        }
        state.account_senders.push((*program, sender));
        drop(state);
        Ok(Self::idle_subscription())
    }

    async fn subscribe_program_logs(
        &self,
        url: &str,
        program: &Pubkey,
        sender: mpsc::Sender<LogsUpdate>,
    ) -> Result<TransportSubscription, RpcError> {
        self.record("logs_subscribe", url);
        let mut state = self.state.lock().unwrap();
        if state.subscribe_failures.contains(program) {
            return Err(RpcError::transient(
                "logs_subscribe",
                "établissement refusé par le scénario de test",
            ));
        }
        state.logs_senders.push((*program, sender));
        drop(state);
        Ok(Self::idle_subscription())
    }
}
