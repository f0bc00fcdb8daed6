//! In-memory ledger store, the default on the light-client side.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{LedgerStore, SsLedger, StoreError};

/// Mutex-protected map store keyed by `"{cycle}_{partner}"`, with the list
/// of elapsed cycles tracked alongside the entries.
pub struct MapLedgerStore {
    inner: Mutex<Inner>,
}

struct Inner {
    curr_cycle: i64,
    ledgers: HashMap<String, SsLedger>,
    pending: Vec<i64>,
}

impl MapLedgerStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                curr_cycle: 1,
                ledgers: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }
}

impl Default for MapLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn key(cycle: i64, partner: &str) -> String {
        format!("{cycle}_{partner}")
    }

    fn cycle_entries(&self, cycle: i64) -> Vec<SsLedger> {
        let prefix = format!("{cycle}_");
        self.ledgers
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl LedgerStore for MapLedgerStore {
    fn get(&self, val: &mut SsLedger) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        let key = Inner::key(inner.curr_cycle, &val.partner);
        match inner.ledgers.get(&key) {
            Some(entry) => {
                *val = entry.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn store(&self, val: &SsLedger) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = Inner::key(inner.curr_cycle, &val.partner);
        inner.ledgers.insert(key, val.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<SsLedger>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.cycle_entries(inner.curr_cycle))
    }

    fn update(&self, new_cycle: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let old = inner.curr_cycle;
        inner.pending.push(old);
        inner.curr_cycle = new_cycle;
        Ok(())
    }

    fn billing_cycle(&self) -> i64 {
        self.inner.lock().curr_cycle
    }

    fn get_pending(&self) -> Result<BTreeMap<i64, Vec<SsLedger>>, StoreError> {
        let inner = self.inner.lock();
        let mut out = BTreeMap::new();
        for &cycle in &inner.pending {
            let entries = inner.cycle_entries(cycle);
            if !entries.is_empty() {
                out.insert(cycle, entries);
            }
        }
        Ok(out)
    }

    fn clear_pending(&self, cycles: &[i64]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.inner.lock();
        let mut cleared = Vec::new();
        for &cycle in cycles {
            if let Some(idx) = inner.pending.iter().position(|&p| p == cycle) {
                inner.pending.remove(idx);
                cleared.push(cycle);
                let prefix = format!("{cycle}_");
                inner.ledgers.retain(|k, _| !k.starts_with(&prefix));
            }
        }
        Ok(cleared)
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
