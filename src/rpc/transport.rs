// DANS : src/rpc/transport.rs

use crate::rpc::error::RpcError;
use async_trait::async_trait;
use futures_util::StreamExt;
use solana_account_decoder::UiAccountEncoding;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_config::{
        RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionConfig,
        RpcTransactionLogsConfig, RpcTransactionLogsFilter,
    },
    rpc_filter::RpcFilterType,
};
use solana_sdk::{
    account::Account, commitment_config::CommitmentConfig, pubkey::Pubkey, signature::Signature,
};
use solana_transaction_status::UiTransactionEncoding;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Notification push : les données brutes d'un compte appartenant à un
/// programme surveillé viennent de changer (ou le compte vient d'être créé).
#[derive(Debug, Clone)]
pub struct AccountUpdate {
    pub program: Pubkey,
    pub address: Pubkey,
    pub data: Vec<u8>,
}

/// Notification push : une transaction mentionnant le programme surveillé a
/// émis ces lignes de log.
#[derive(Debug, Clone)]
pub struct LogsUpdate {
    pub program: Pubkey,
    pub signature: String,
    pub logs: Vec<String>,
}

/// Pré-filtre grossier par taille de compte, appliqué côté serveur pour
/// réduire le volume de faux candidats. `None` = pas de filtre.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramAccountFilter {
    pub data_len: Option<u64>,
}

impl ProgramAccountFilter {
    fn to_rpc_filters(self) -> Option<Vec<RpcFilterType>> {
        self.data_len.map(|n| vec![RpcFilterType::DataSize(n)])
    }
}

/// La tâche de fond qui lit le stream WebSocket d'un abonnement.
/// La casser (abort) est le seul moyen de désabonnement garanti : le
/// transport distant ne supporte pas l'annulation des livraisons en vol.
#[derive(Debug)]
pub struct TransportSubscription {
    task: tokio::task::JoinHandle<()>,
}

impl TransportSubscription {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// L'interface étroite vers le nœud RPC. Chaque méthode reçoit l'URL de
/// l'endpoint à utiliser : c'est le `ConnectionManager` qui décide lequel
/// est courant, le transport n'a aucun état de bascule.
///
/// Toute la logique de détection ne dépend que de ce trait, jamais d'un
/// client concret, ce qui permet de substituer un transport simulé en test.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn get_account(&self, url: &str, address: &Pubkey) -> Result<Account, RpcError>;

    async fn get_multiple_accounts(
        &self,
        url: &str,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, RpcError>;

    async fn get_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        filter: ProgramAccountFilter,
    ) -> Result<Vec<(Pubkey, Account)>, RpcError>;

    /// Récupère une transaction confirmée et en extrait les comptes impliqués.
    async fn get_transaction_accounts(
        &self,
        url: &str,
        signature: &Signature,
    ) -> Result<Vec<Pubkey>, RpcError>;

    /// La sonde de santé : un aller-retour léger.
    async fn get_slot(&self, url: &str) -> Result<u64, RpcError>;

    async fn subscribe_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        filter: ProgramAccountFilter,
        sender: mpsc::Sender<AccountUpdate>,
    ) -> Result<TransportSubscription, RpcError>;

    async fn subscribe_program_logs(
        &self,
        url: &str,
        program: &Pubkey,
        sender: mpsc::Sender<LogsUpdate>,
    ) -> Result<TransportSubscription, RpcError>;
}

/// Dérive l'URL WebSocket d'un endpoint HTTP, selon la convention Solana :
/// même hôte, schéma ws(s), port explicite incrémenté de 1 (8899 -> 8900).
pub fn ws_url_from_http(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(("https", rest)) => ("wss", rest),
        Some(("http", rest)) => ("ws", rest),
        _ => return url.to_string(),
    };
    if let Some((host, port)) = rest.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
        && let Some(ws_port) = port.checked_add(1)
    {
        return format!("{scheme}://{host}:{ws_port}");
    }
    format!("{scheme}://{rest}")
}

/// Le transport réel, au-dessus des clients non-bloquants de `solana-client`.
/// Les clients HTTP sont mis en cache par URL ; les abonnements ouvrent une
/// connexion WebSocket dédiée dont la durée de vie est celle de la tâche.
pub struct SolanaTransport {
    commitment: CommitmentConfig,
    clients: Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl SolanaTransport {
    pub fn new() -> Self {
        Self {
            commitment: CommitmentConfig::confirmed(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, url: &str) -> Arc<RpcClient> {
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(RpcClient::new_with_commitment(url.to_string(), self.commitment))
            })
            .clone()
    }

    fn account_config(&self) -> RpcAccountInfoConfig {
        RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            data_slice: None,
            commitment: Some(self.commitment),
            min_context_slot: None,
        }
    }
}

impl Default for SolanaTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Détermine si une erreur du client doit être ré-essayée, et la traduit
/// dans notre taxonomie. Les erreurs réseau et les refus du nœud sont
/// transitoires ; tout le reste (requête malformée, parsing) est permanent.
fn classify(op: &'static str, error: ClientError) -> RpcError {
    let transient = matches!(
        error.kind,
        ClientErrorKind::Reqwest(_) | ClientErrorKind::RpcError(_) | ClientErrorKind::Io(_)
    );
    if transient {
        RpcError::transient(op, error.to_string())
    } else {
        RpcError::permanent(op, error.to_string())
    }
}

#[async_trait]
impl RpcTransport for SolanaTransport {
    async fn get_account(&self, url: &str, address: &Pubkey) -> Result<Account, RpcError> {
        self.client(url)
            .get_account(address)
            .await
            .map_err(|e| classify("get_account", e))
    }

    async fn get_multiple_accounts(
        &self,
        url: &str,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<Account>>, RpcError> {
        self.client(url)
            .get_multiple_accounts(addresses)
            .await
            .map_err(|e| classify("get_multiple_accounts", e))
    }

    async fn get_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        filter: ProgramAccountFilter,
    ) -> Result<Vec<(Pubkey, Account)>, RpcError> {
        let config = RpcProgramAccountsConfig {
            filters: filter.to_rpc_filters(),
            account_config: self.account_config(),
            with_context: Some(false),
            sort_results: None,
        };
        self.client(url)
            .get_program_accounts_with_config(program, config)
            .await
            .map_err(|e| classify("get_program_accounts", e))
    }

    async fn get_transaction_accounts(
        &self,
        url: &str,
        signature: &Signature,
    ) -> Result<Vec<Pubkey>, RpcError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let confirmed = self
            .client(url)
            .get_transaction_with_config(signature, config)
            .await
            .map_err(|e| classify("get_transaction", e))?;

        let transaction = confirmed
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| RpcError::permanent("get_transaction", "transaction non décodable"))?;

        Ok(transaction.message.static_account_keys().to_vec())
    }

    async fn get_slot(&self, url: &str) -> Result<u64, RpcError> {
        self.client(url)
            .get_slot()
            .await
            .map_err(|e| classify("get_slot", e))
    }

    async fn subscribe_program_accounts(
        &self,
        url: &str,
        program: &Pubkey,
        filter: ProgramAccountFilter,
        sender: mpsc::Sender<AccountUpdate>,
    ) -> Result<TransportSubscription, RpcError> {
        let ws_url = ws_url_from_http(url);
        let program = *program;
        let config = RpcProgramAccountsConfig {
            filters: filter.to_rpc_filters(),
            account_config: self.account_config(),
            with_context: None,
            sort_results: None,
        };

        // L'établissement se fait dans la tâche (le stream emprunte le client
        // pubsub), mais le résultat est rapporté de façon synchrone via un
        // oneshot pour que l'appelant voie les erreurs de setup.
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let client = match PubsubClient::new(&ws_url).await {
                Ok(client) => client,
                Err(e) => {
                    let _ = ready_tx.send(Err(RpcError::transient(
                        "program_subscribe",
                        e.to_string(),
                    )));
                    return;
                }
            };
            let (mut stream, unsubscribe) =
                match client.program_subscribe(&program, Some(config)).await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RpcError::transient(
                            "program_subscribe",
                            e.to_string(),
                        )));
                        return;
                    }
                };
            let _ = ready_tx.send(Ok(()));

            while let Some(update) = stream.next().await {
                let keyed = update.value;
                let Ok(address) = Pubkey::from_str(&keyed.pubkey) else {
                    warn!(pubkey = %keyed.pubkey, "adresse illisible dans une notification de compte");
                    continue;
                };
                let Some(data) = keyed.account.data.decode() else {
                    warn!(address = %address, "données de compte non décodables, notification ignorée");
                    continue;
                };
                if sender.send(AccountUpdate { program, address, data }).await.is_err() {
                    // Le récepteur est parti : plus personne n'écoute.
                    break;
                }
            }
            drop(stream);
            unsubscribe().await;
            debug!(program = %program, "stream de comptes terminé");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(TransportSubscription::new(task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::transient(
                "program_subscribe",
                "la tâche d'abonnement s'est terminée avant l'établissement",
            )),
        }
    }

    async fn subscribe_program_logs(
        &self,
        url: &str,
        program: &Pubkey,
        sender: mpsc::Sender<LogsUpdate>,
    ) -> Result<TransportSubscription, RpcError> {
        let ws_url = ws_url_from_http(url);
        let program = *program;
        let filter = RpcTransactionLogsFilter::Mentions(vec![program.to_string()]);
        let config = RpcTransactionLogsConfig { commitment: Some(self.commitment) };

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let client = match PubsubClient::new(&ws_url).await {
                Ok(client) => client,
                Err(e) => {
                    let _ = ready_tx
                        .send(Err(RpcError::transient("logs_subscribe", e.to_string())));
                    return;
                }
            };
            let (mut stream, unsubscribe) = match client.logs_subscribe(filter, config).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = ready_tx
                        .send(Err(RpcError::transient("logs_subscribe", e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            while let Some(update) = stream.next().await {
                let logs = update.value;
                // Une transaction échouée n'a pas pu initialiser de pool.
                if logs.err.is_some() {
                    continue;
                }
                let update = LogsUpdate {
                    program,
                    signature: logs.signature,
                    logs: logs.logs,
                };
                if sender.send(update).await.is_err() {
                    break;
                }
            }
            drop(stream);
            unsubscribe().await;
            debug!(program = %program, "stream de logs terminé");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(TransportSubscription::new(task)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::transient(
                "logs_subscribe",
                "la tâche d'abonnement s'est terminée avant l'établissement",
            )),
        }
    }
}
