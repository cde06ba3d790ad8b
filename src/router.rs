use rand::Rng;

use crate::store::{Account, AccountKind, AccountStore};

/// Models only the Gemini channel can serve.
const GEMINI_ONLY_MODELS: &[&str] = &["claude-sonnet-4-5-thinking"];

/// Models only the CodeWhisperer channel can serve.
const CODEWHISPERER_ONLY_MODELS: &[&str] = &["claude-sonnet-4", "claude-haiku-4.5"];

/// Pick a provider channel for the requested model.
///
/// Exclusive models bind their channel outright; everything else is a
/// weighted random choice by live account counts, degenerating to the
/// non-empty side. Returns None when no channel has accounts.
pub fn route_channel<R: Rng>(
    model: &str,
    codewhisperer_count: usize,
    gemini_count: usize,
    rng: &mut R,
) -> Option<AccountKind> {
    if model.starts_with("gemini") || GEMINI_ONLY_MODELS.contains(&model) {
        return (gemini_count > 0).then_some(AccountKind::Gemini);
    }

    if CODEWHISPERER_ONLY_MODELS.contains(&model) {
        return (codewhisperer_count > 0).then_some(AccountKind::Codewhisperer);
    }

    match (codewhisperer_count, gemini_count) {
        (0, 0) => None,
        (0, _) => Some(AccountKind::Gemini),
        (_, 0) => Some(AccountKind::Codewhisperer),
        (cw, gem) => {
            let roll = rng.gen_range(1..=cw + gem);
            if roll <= cw {
                Some(AccountKind::Codewhisperer)
            } else {
                Some(AccountKind::Gemini)
            }
        }
    }
}

/// Uniformly sample one account from the candidates.
pub fn pick_account<R: Rng>(accounts: &[Account], rng: &mut R) -> Option<Account> {
    if accounts.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..accounts.len());
    Some(accounts[idx].clone())
}

/// Enabled accounts of a channel that can serve `model`. Gemini candidates
/// are filtered by the quota ledger; CodeWhisperer has no per-model ledger.
pub fn eligible_accounts(
    store: &AccountStore,
    kind: AccountKind,
    model: &str,
) -> crate::error::GatewayResult<Vec<Account>> {
    let accounts = store.list_enabled(Some(kind))?;
    if kind != AccountKind::Gemini {
        return Ok(accounts);
    }

    Ok(accounts
        .into_iter()
        .filter(|account| store.is_model_available(account, model))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewAccount;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seeded() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_gemini_exclusive_models() {
        let mut rng = seeded();
        assert_eq!(
            route_channel("gemini-2.5-pro", 3, 1, &mut rng),
            Some(AccountKind::Gemini)
        );
        assert_eq!(
            route_channel("claude-sonnet-4-5-thinking", 3, 1, &mut rng),
            Some(AccountKind::Gemini)
        );
        // Exclusive model with no accounts on its channel: unroutable.
        assert_eq!(route_channel("gemini-2.5-pro", 3, 0, &mut rng), None);
    }

    #[test]
    fn test_codewhisperer_exclusive_models() {
        let mut rng = seeded();
        assert_eq!(
            route_channel("claude-sonnet-4", 1, 5, &mut rng),
            Some(AccountKind::Codewhisperer)
        );
        assert_eq!(
            route_channel("claude-haiku-4.5", 1, 5, &mut rng),
            Some(AccountKind::Codewhisperer)
        );
        assert_eq!(route_channel("claude-sonnet-4", 0, 5, &mut rng), None);
    }

    #[test]
    fn test_shared_model_degenerates_to_nonempty_side() {
        let mut rng = seeded();
        assert_eq!(
            route_channel("claude-sonnet-4.5", 0, 2, &mut rng),
            Some(AccountKind::Gemini)
        );
        assert_eq!(
            route_channel("claude-sonnet-4.5", 2, 0, &mut rng),
            Some(AccountKind::Codewhisperer)
        );
        assert_eq!(route_channel("claude-sonnet-4.5", 0, 0, &mut rng), None);
    }

    #[test]
    fn test_weighted_choice_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(
                route_channel("claude-sonnet-4.5", 3, 7, &mut a),
                route_channel("claude-sonnet-4.5", 3, 7, &mut b)
            );
        }
    }

    #[test]
    fn test_pick_account_uniform_and_empty() {
        let mut rng = seeded();
        assert!(pick_account(&[], &mut rng).is_none());
    }

    #[test]
    fn test_eligible_accounts_filters_exhausted_gemini() {
        let store = AccountStore::open_in_memory().unwrap();
        let a = store
            .create(NewAccount {
                client_id: "a".into(),
                client_secret: "a".into(),
                kind: Some(AccountKind::Gemini),
                ..Default::default()
            })
            .unwrap();
        let b = store
            .create(NewAccount {
                client_id: "b".into(),
                client_secret: "b".into(),
                kind: Some(AccountKind::Gemini),
                ..Default::default()
            })
            .unwrap();

        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        store
            .mark_model_exhausted(&a.id, "claude-sonnet-4-5", &future)
            .unwrap();

        let eligible =
            eligible_accounts(&store, AccountKind::Gemini, "claude-sonnet-4-5").unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, b.id);

        // Both exhausted: nothing eligible.
        store
            .mark_model_exhausted(&b.id, "claude-sonnet-4-5", &future)
            .unwrap();
        assert!(
            eligible_accounts(&store, AccountKind::Gemini, "claude-sonnet-4-5")
                .unwrap()
                .is_empty()
        );
    }
}
