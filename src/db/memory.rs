use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;

use super::StateStore;
use crate::models::AccountState;

#[derive(Debug, Default)]
struct Tables {
    states: HashMap<String, AccountState>,
    events: Vec<(String, String, String)>,
}

/// Process-local state store for tests and dry runs without a database file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// `(kind, detail)` pairs recorded for a bot, oldest first.
    pub fn events(&self, bot_id: &str) -> Vec<(String, String)> {
        self.tables()
            .events
            .iter()
            .filter(|(id, _, _)| id == bot_id)
            .map(|(_, kind, detail)| (kind.clone(), detail.clone()))
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read_state(&self, bot_id: &str) -> Result<Option<AccountState>> {
        Ok(self.tables().states.get(bot_id).cloned())
    }

    async fn write_state(&self, bot_id: &str, state: &AccountState) -> Result<()> {
        self.tables()
            .states
            .insert(bot_id.to_string(), state.clone());
        Ok(())
    }

    async fn clear_state(&self, bot_id: &str) -> Result<()> {
        self.tables().states.remove(bot_id);
        Ok(())
    }

    async fn record_event(&self, bot_id: &str, kind: &str, detail: &str) -> Result<()> {
        self.tables()
            .events
            .push((bot_id.to_string(), kind.to_string(), detail.to_string()));
        Ok(())
    }
}
