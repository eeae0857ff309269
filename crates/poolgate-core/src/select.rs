use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::concurrency::{calculate_max_wait, Scope, SlotController, SlotPermit};
use crate::registry::{Account, PoolRegistry};
use crate::sticky::StickyStore;

/// Fallback when no candidate had a free slot: the caller queues on the
/// top-ranked account with these bounds.
#[derive(Debug)]
pub struct WaitPlan {
    pub max_active: u32,
    pub max_waiting: u32,
}

#[derive(Debug)]
pub enum Admission {
    Acquired(SlotPermit),
    Wait(WaitPlan),
}

#[derive(Debug)]
pub struct Selection {
    pub account: Arc<Account>,
    pub admission: Admission,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no accounts available for the requested model")]
    NoAccount,
}

/// Pick an account for this request: filter by health and model support,
/// prefer a live sticky binding, rank the rest by current load, and sweep
/// for an immediate slot before falling back to a wait plan.
pub fn select_account(
    registry: &PoolRegistry,
    slots: &SlotController,
    sticky: &StickyStore,
    group_id: i64,
    session_hash: &str,
    model: &str,
    failed: &HashSet<i64>,
) -> Result<Selection, SelectError> {
    let mut candidates: Vec<Arc<Account>> = registry
        .accounts_for_group(group_id)
        .into_iter()
        .filter(|account| {
            account.enabled
                && account.healthy
                && account.supports_model(model)
                && !failed.contains(&account.id)
        })
        .collect();
    if candidates.is_empty() {
        return Err(SelectError::NoAccount);
    }

    candidates.sort_by(|a, b| {
        load_ratio(slots, a)
            .partial_cmp(&load_ratio(slots, b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| tie_break(a.id, session_hash).cmp(&tie_break(b.id, session_hash)))
    });

    if !session_hash.is_empty() {
        if let Some(bound_id) = sticky.get(group_id, session_hash) {
            if let Some(pos) = candidates.iter().position(|a| a.id == bound_id) {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        }
    }

    for account in &candidates {
        if let Some(permit) =
            slots.try_acquire(Scope::Account(account.id), account.max_concurrency)
        {
            sticky.bind(group_id, session_hash, account.id);
            debug!(
                event = "account_selected",
                account_id = account.id,
                account = %account.name,
                immediate = true
            );
            return Ok(Selection {
                account: account.clone(),
                admission: Admission::Acquired(permit),
            });
        }
    }

    let top = candidates.remove(0);
    debug!(
        event = "account_selected",
        account_id = top.id,
        account = %top.name,
        immediate = false
    );
    let plan = WaitPlan {
        max_active: top.max_concurrency,
        max_waiting: calculate_max_wait(top.max_concurrency as i32),
    };
    Ok(Selection {
        account: top,
        admission: Admission::Wait(plan),
    })
}

fn load_ratio(slots: &SlotController, account: &Account) -> f64 {
    let (active, _) = slots.load(Scope::Account(account.id));
    if account.max_concurrency == 0 {
        return f64::INFINITY;
    }
    active as f64 / account.max_concurrency as f64
}

/// Stable per-session shuffle among equally loaded accounts.
fn tie_break(account_id: i64, session_hash: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(account_id.to_le_bytes());
    hasher.update(session_hash.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
