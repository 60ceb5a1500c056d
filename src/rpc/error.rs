// DANS : src/rpc/error.rs

use thiserror::Error;

/// La taxonomie des erreurs RPC.
///
/// Une erreur transitoire (réseau, timeout, nœud surchargé) est ré-essayée
/// automatiquement par le `ConnectionManager`. Une erreur permanente (requête
/// malformée, adresse invalide côté distant) ne l'est jamais : la ré-essayer
/// ne ferait que consommer le budget de tentatives pour rien.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("erreur transitoire pendant {op}: {message}")]
    Transient { op: &'static str, message: String },

    #[error("erreur permanente pendant {op}: {message}")]
    Permanent { op: &'static str, message: String },
}

impl RpcError {
    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self::Transient { op, message: message.into() }
    }

    pub fn permanent(op: &'static str, message: impl Into<String>) -> Self {
        Self::Permanent { op, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Transient { op, .. } | Self::Permanent { op, .. } => op,
        }
    }
}
