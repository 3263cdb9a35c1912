// src/store/memory.rs
//
// In-memory store backend
//
// Reference implementation of the store contract; also the test backend.
// Batches are validated in full before any record is touched, so a failed
// batch leaves the maps unchanged.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::key::CompositeKey;
use crate::store::{Applied, Store, StoreError, StoreResult, StoredRecord, WriteOp};

#[derive(Debug, Clone)]
struct MemRecord {
    payload: Value,
    token: i64,
    updated_at: chrono::DateTime<Utc>,
}

/// Map-backed store. Sets are created on first write; scans come back in
/// key order.
#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, BTreeMap<CompositeKey, MemRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<CompositeKey, MemRecord>>> {
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrites a record's token without going through a tracked update.
    /// Test hook for provoking concurrency conflicts.
    pub fn force_token(&self, set: &str, key: &CompositeKey, token: i64) -> bool {
        let mut sets = self.lock();
        match sets.get_mut(set).and_then(|records| records.get_mut(key)) {
            Some(record) => {
                record.token = token;
                true
            }
            None => false,
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, set: &str, key: &CompositeKey) -> StoreResult<Option<StoredRecord>> {
        let sets = self.lock();
        Ok(sets.get(set).and_then(|records| {
            records.get(key).map(|record| StoredRecord {
                key: key.clone(),
                payload: record.payload.clone(),
                token: record.token,
                updated_at: record.updated_at,
            })
        }))
    }

    fn scan(&self, set: &str) -> StoreResult<Vec<StoredRecord>> {
        let sets = self.lock();
        Ok(sets
            .get(set)
            .map(|records| {
                records
                    .iter()
                    .map(|(key, record)| StoredRecord {
                        key: key.clone(),
                        payload: record.payload.clone(),
                        token: record.token,
                        updated_at: record.updated_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn contains(&self, set: &str, key: &CompositeKey) -> StoreResult<bool> {
        let sets = self.lock();
        Ok(sets
            .get(set)
            .map(|records| records.contains_key(key))
            .unwrap_or(false))
    }

    fn count(&self, set: &str) -> StoreResult<u64> {
        let sets = self.lock();
        Ok(sets.get(set).map(|records| records.len() as u64).unwrap_or(0))
    }

    fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Applied>> {
        let mut sets = self.lock();

        // Validation pass: nothing is mutated until every op is known good.
        for op in &ops {
            let existing = sets.get(op.set()).and_then(|records| records.get(op.key()));
            match op {
                WriteOp::Insert { set, key, .. } => {
                    if existing.is_some() {
                        return Err(StoreError::DuplicateKey {
                            set: set.clone(),
                            key: key.clone(),
                        });
                    }
                }
                WriteOp::Update { set, key, expected, .. }
                | WriteOp::Delete { set, key, expected } => {
                    let found = existing.map(|record| record.token);
                    let stale = match (expected, found) {
                        (_, None) => true,
                        (Some(expected), Some(found)) => *expected != found,
                        (None, Some(_)) => false,
                    };
                    if stale {
                        return Err(StoreError::TokenMismatch {
                            set: set.clone(),
                            key: key.clone(),
                            expected: *expected,
                            found,
                        });
                    }
                }
            }
        }

        let now = Utc::now();
        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Insert { set, key, payload } => {
                    let records = sets.entry(set.clone()).or_default();
                    records.insert(
                        key.clone(),
                        MemRecord {
                            payload,
                            token: 1,
                            updated_at: now,
                        },
                    );
                    applied.push(Applied {
                        set,
                        key,
                        token: Some(1),
                    });
                }
                WriteOp::Update { set, key, payload, .. } => {
                    let records = sets.entry(set.clone()).or_default();
                    let record = records.get_mut(&key).expect("validated above");
                    record.payload = payload;
                    record.token += 1;
                    record.updated_at = now;
                    let token = record.token;
                    applied.push(Applied {
                        set,
                        key,
                        token: Some(token),
                    });
                }
                WriteOp::Delete { set, key, .. } => {
                    if let Some(records) = sets.get_mut(&set) {
                        records.remove(&key);
                    }
                    applied.push(Applied {
                        set,
                        key,
                        token: None,
                    });
                }
            }
        }
        Ok(applied)
    }
}
