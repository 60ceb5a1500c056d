// DANS : src/detection/classifier.rs

use crate::detection::profiles::ExchangeProfile;
use solana_sdk::pubkey::Pubkey;

/// Un compte classé comme pool, avec sa paire de tokens extraite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCandidate {
    pub address: Pubkey,
    pub base_mint: Pubkey,
    pub quote_mint: Pubkey,
}

/// Décide si un compte brut est un pool de l'exchange décrit par `profile`,
/// et si oui en extrait la paire de mints aux offsets fixes de la table.
///
/// Fonction pure et sans état : appelable depuis n'importe quel canal de
/// détection sans coordination. Un compte malformé ou trop court n'est pas
/// une erreur, c'est un candidat écarté : on retourne `None` en silence.
pub fn classify(address: &Pubkey, data: &[u8], profile: &ExchangeProfile) -> Option<PoolCandidate> {
    if data.len() != profile.pool_account_size {
        return None;
    }
    if let Some(discriminator) = &profile.discriminator
        && data.get(..discriminator.len()) != Some(discriminator.as_slice())
    {
        return None;
    }
    let base_mint = read_pubkey(data, profile.base_mint_offset)?;
    let quote_mint = read_pubkey(data, profile.quote_mint_offset)?;
    Some(PoolCandidate { address: *address, base_mint, quote_mint })
}

/// Vrai si un lot de lignes de log contient un des mots-clés de création de
/// pool de l'exchange.
pub fn matches_creation_logs(logs: &[String], profile: &ExchangeProfile) -> bool {
    logs.iter().any(|line| {
        profile
            .creation_log_keywords
            .iter()
            .any(|keyword| line.contains(keyword.as_str()))
    })
}

fn read_pubkey(data: &[u8], offset: usize) -> Option<Pubkey> {
    let bytes = data.get(offset..offset + 32)?;
    Pubkey::try_from(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::profiles::default_profiles;
    use crate::detection::types::DexKind;

    fn profile_for(kind: DexKind) -> ExchangeProfile {
        default_profiles()
            .into_iter()
            .find(|p| p.exchange == kind)
            .unwrap()
    }

    /// Fabrique un compte synthétique conforme au profil, avec les deux
    /// mints plantés aux offsets attendus.
    fn synthetic_pool(profile: &ExchangeProfile, base: Pubkey, quote: Pubkey) -> Vec<u8> {
        let mut data = vec![0u8; profile.pool_account_size];
        if let Some(disc) = &profile.discriminator {
            data[..disc.len()].copy_from_slice(disc);
        }
        data[profile.base_mint_offset..profile.base_mint_offset + 32]
            .copy_from_slice(base.as_ref());
        data[profile.quote_mint_offset..profile.quote_mint_offset + 32]
            .copy_from_slice(quote.as_ref());
        data
    }

    #[test]
    fn classifies_well_formed_accounts_and_extracts_the_pair() {
        for kind in [DexKind::RaydiumAmmV4, DexKind::PumpAmm, DexKind::OrcaWhirlpool] {
            let profile = profile_for(kind);
            let address = Pubkey::new_unique();
            let base = Pubkey::new_unique();
            let quote = Pubkey::new_unique();
            let data = synthetic_pool(&profile, base, quote);

            let candidate = classify(&address, &data, &profile).unwrap();
            assert_eq!(candidate.address, address);
            assert_eq!(candidate.base_mint, base);
            assert_eq!(candidate.quote_mint, quote);
        }
    }

    #[test]
    fn rejects_wrong_sized_accounts_silently() {
        let profile = profile_for(DexKind::RaydiumAmmV4);
        let address = Pubkey::new_unique();

        assert_eq!(classify(&address, &[], &profile), None);
        assert_eq!(classify(&address, &vec![0u8; 100], &profile), None);
        assert_eq!(
            classify(&address, &vec![0u8; profile.pool_account_size + 1], &profile),
            None
        );
    }

    #[test]
    fn rejects_wrong_discriminator() {
        let profile = profile_for(DexKind::PumpAmm);
        let address = Pubkey::new_unique();
        let mut data = synthetic_pool(&profile, Pubkey::new_unique(), Pubkey::new_unique());
        data[0] ^= 0xff;

        assert_eq!(classify(&address, &data, &profile), None);
    }

    #[test]
    fn creation_keywords_match_per_exchange() {
        let raydium = profile_for(DexKind::RaydiumAmmV4);
        let pump = profile_for(DexKind::PumpAmm);

        let logs = vec![
            "Program log: initialize2: InitializeInstruction2 { nonce: 254, ... }".to_string(),
        ];
        assert!(matches_creation_logs(&logs, &raydium));
        assert!(!matches_creation_logs(&logs, &pump));

        let logs = vec!["Program log: Instruction: CreatePool".to_string()];
        assert!(matches_creation_logs(&logs, &pump));
        assert!(!matches_creation_logs(&logs, &raydium));

        assert!(!matches_creation_logs(&[], &raydium));
        assert!(!matches_creation_logs(
            &["Program log: Instruction: Swap".to_string()],
            &raydium
        ));
    }
}
