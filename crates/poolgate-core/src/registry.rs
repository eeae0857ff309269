use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use poolgate_storage::{AccountRow, GroupRow, StorageSnapshot};

/// Upstream provider credential plus its routing metadata.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub base_url: String,
    pub credential: String,
    pub enabled: bool,
    pub healthy: bool,
    pub max_concurrency: u32,
    /// Empty list advertises every model.
    pub supported_models: Vec<String>,
}

impl Account {
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty()
            || self.supported_models.iter().any(|m| m == model)
    }
}

/// Pool-wide billing configuration carried by a group.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub cache_read_transfer_ratio: f64,
    pub cache_read_transfer_probability: f64,
}

/// In-memory view of groups and their accounts. Runtime reads never touch
/// the database; admin mutations swap in a fresh snapshot.
pub struct PoolRegistry {
    accounts: ArcSwap<Vec<Arc<Account>>>,
    groups: ArcSwap<HashMap<i64, Group>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            accounts: ArcSwap::from_pointee(Vec::new()),
            groups: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn from_snapshot(snapshot: &StorageSnapshot) -> Self {
        let registry = Self::new();
        registry.replace(snapshot);
        registry
    }

    pub fn replace(&self, snapshot: &StorageSnapshot) {
        let accounts: Vec<Arc<Account>> = snapshot
            .accounts
            .iter()
            .map(|row| Arc::new(account_from_row(row)))
            .collect();
        let groups: HashMap<i64, Group> = snapshot
            .groups
            .iter()
            .map(|row| (row.id, group_from_row(row)))
            .collect();
        self.accounts.store(Arc::new(accounts));
        self.groups.store(Arc::new(groups));
    }

    pub fn group(&self, group_id: i64) -> Option<Group> {
        self.groups.load().get(&group_id).cloned()
    }

    pub fn accounts_for_group(&self, group_id: i64) -> Vec<Arc<Account>> {
        self.accounts
            .load()
            .iter()
            .filter(|account| account.group_id == group_id)
            .cloned()
            .collect()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn account_from_row(row: &AccountRow) -> Account {
    Account {
        id: row.id,
        name: row.name.clone(),
        group_id: row.group_id,
        base_url: row.base_url.clone(),
        credential: row.credential.clone(),
        enabled: row.enabled,
        healthy: row.healthy,
        max_concurrency: row.max_concurrency.max(0) as u32,
        supported_models: row.supported_models.clone(),
    }
}

fn group_from_row(row: &GroupRow) -> Group {
    Group {
        id: row.id,
        name: row.name.clone(),
        cache_read_transfer_ratio: row.cache_read_transfer_ratio,
        cache_read_transfer_probability: row.cache_read_transfer_probability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64, models: &[&str]) -> Account {
        Account {
            id,
            name: format!("acct-{id}"),
            group_id: 1,
            base_url: "https://upstream.example".to_string(),
            credential: "sk-test".to_string(),
            enabled: true,
            healthy: true,
            max_concurrency: 4,
            supported_models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn empty_model_list_accepts_everything() {
        let acct = account(1, &[]);
        assert!(acct.supports_model("claude-3-5-sonnet-20241022"));
        assert!(acct.supports_model("gpt-x"));
    }

    #[test]
    fn explicit_model_list_is_exact() {
        let acct = account(1, &["claude-3-5-sonnet-20241022"]);
        assert!(acct.supports_model("claude-3-5-sonnet-20241022"));
        assert!(!acct.supports_model("claude-3-opus"));
    }
}
