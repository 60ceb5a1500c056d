// DANS : src/detection/profiles.rs

use crate::detection::types::DexKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::{pubkey, pubkey::Pubkey};
use std::fs;

pub const RAYDIUM_AMM_V4_PROGRAM_ID: Pubkey = pubkey!("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8");
pub const PUMP_AMM_PROGRAM_ID: Pubkey = pubkey!("pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA");
pub const ORCA_WHIRLPOOL_PROGRAM_ID: Pubkey = pubkey!("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc");

/// La table d'heuristiques d'un exchange : taille de compte attendue,
/// discriminateur, offsets des mints et mots-clés de création dans les logs.
///
/// Ces constantes sont rétro-ingéniérées et liées à une version précise du
/// programme de l'exchange. Si l'exchange change son layout, des pools
/// peuvent passer silencieusement au travers : c'est une limite de précision
/// assumée, d'où des tables configurables plutôt que du code en dur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeProfile {
    pub exchange: DexKind,
    #[serde(with = "pubkey_base58")]
    pub program_id: Pubkey,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Taille exacte du compte pool ; sert aussi de pré-filtre côté serveur.
    pub pool_account_size: usize,
    /// Préfixe discriminateur du compte (absent pour les programmes pré-Anchor).
    #[serde(default)]
    pub discriminator: Option<Vec<u8>>,
    pub base_mint_offset: usize,
    pub quote_mint_offset: usize,
    /// Sous-chaînes de log signalant une instruction d'initialisation de pool.
    pub creation_log_keywords: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Les tables intégrées pour les exchanges supportés.
pub fn default_profiles() -> Vec<ExchangeProfile> {
    vec![
        ExchangeProfile {
            exchange: DexKind::RaydiumAmmV4,
            program_id: RAYDIUM_AMM_V4_PROGRAM_ID,
            enabled: true,
            pool_account_size: 752,
            discriminator: None,
            base_mint_offset: 400,
            quote_mint_offset: 432,
            creation_log_keywords: vec![
                "initialize2".to_string(),
                "init_pc_amount".to_string(),
            ],
        },
        ExchangeProfile {
            exchange: DexKind::PumpAmm,
            program_id: PUMP_AMM_PROGRAM_ID,
            enabled: true,
            pool_account_size: 243,
            discriminator: Some(vec![241, 154, 109, 4, 17, 177, 109, 188]),
            base_mint_offset: 43,
            quote_mint_offset: 75,
            creation_log_keywords: vec!["Instruction: CreatePool".to_string()],
        },
        ExchangeProfile {
            exchange: DexKind::OrcaWhirlpool,
            program_id: ORCA_WHIRLPOOL_PROGRAM_ID,
            enabled: true,
            pool_account_size: 653,
            discriminator: Some(vec![63, 149, 209, 12, 225, 128, 99, 9]),
            base_mint_offset: 101,
            quote_mint_offset: 181,
            creation_log_keywords: vec![
                "Instruction: InitializePool".to_string(),
                "Instruction: InitializePoolV2".to_string(),
            ],
        },
    ]
}

/// Charge les tables depuis un fichier JSON, ou les tables intégrées sans chemin.
pub fn load_profiles(path: Option<&str>) -> Result<Vec<ExchangeProfile>> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("lecture du fichier de profils {path}"))?;
            let profiles: Vec<ExchangeProfile> = serde_json::from_str(&raw)
                .with_context(|| format!("décodage JSON des profils {path}"))?;
            Ok(profiles)
        }
        None => Ok(default_profiles()),
    }
}

/// (Dé)sérialise une Pubkey en base58 pour que les fichiers de profils
/// restent lisibles et éditables à la main.
mod pubkey_base58 {
    use serde::{Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(pubkey: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&pubkey.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pubkey::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profiles_cover_every_dex_kind() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), 3);
        for profile in &profiles {
            assert!(profile.enabled);
            assert!(profile.quote_mint_offset + 32 <= profile.pool_account_size);
            assert!(!profile.creation_log_keywords.is_empty());
        }
    }

    #[test]
    fn profiles_round_trip_through_json_with_base58_program_ids() {
        let json = serde_json::to_string(&default_profiles()).unwrap();
        assert!(json.contains("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8"));

        let parsed: Vec<ExchangeProfile> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].program_id, RAYDIUM_AMM_V4_PROGRAM_ID);
        assert_eq!(parsed[1].discriminator.as_deref(), Some(&[241, 154, 109, 4, 17, 177, 109, 188][..]));
    }
}
