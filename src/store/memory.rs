//! In-memory [`VectorIndex`] for tests and throwaway runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Search is brute-force
//! cosine similarity over all stored vectors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{matches_filter, rank, MetadataFilter, VectorIndex, VectorMatch};
use crate::embedding::cosine_similarity;
use crate::models::{VectorMetadata, VectorRecord};

struct StoredVector {
    record: VectorRecord,
    /// Metadata of every path whose content produced this id.
    owners: BTreeMap<String, VectorMetadata>,
}

pub struct InMemoryVectorIndex {
    collection: String,
    records: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorIndex {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredVector>>> {
        self.records
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredVector>>> {
        self.records
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new("docs_v1")
    }
}

/// Drops `path` from the owners of every id not in `keep`. A record whose
/// last owner goes is removed; otherwise it takes a remaining owner's metadata.
fn release(stored: &mut HashMap<String, StoredVector>, path: &str, keep: &HashSet<&str>) -> usize {
    let mut removed = 0;
    stored.retain(|id, entry| {
        if keep.contains(id.as_str()) || entry.owners.remove(path).is_none() {
            return true;
        }
        match entry.owners.values().next() {
            Some(successor) => {
                if entry.record.metadata.path == path {
                    entry.record.metadata = successor.clone();
                }
                true
            }
            None => {
                removed += 1;
                false
            }
        }
    });
    removed
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.write()?;
        for record in records {
            let owner = (record.metadata.path.clone(), record.metadata.clone());
            match stored.get_mut(&record.id) {
                Some(entry) => {
                    entry.record = record.clone();
                    entry.owners.insert(owner.0, owner.1);
                }
                None => {
                    stored.insert(
                        record.id.clone(),
                        StoredVector {
                            record: record.clone(),
                            owners: BTreeMap::from([owner]),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let stored = self.read()?;
        let matches = stored
            .values()
            .map(|entry| &entry.record)
            .filter(|r| filter.map_or(true, |f| matches_filter(&r.metadata, f)))
            .map(|r| {
                let score = cosine_similarity(embedding, &r.embedding) as f64;
                VectorMatch {
                    id: r.id.clone(),
                    document: r.document.clone(),
                    metadata: r.metadata.clone(),
                    score,
                    distance: 1.0 - score,
                }
            })
            .collect();
        Ok(rank(matches, k))
    }

    async fn retain_for_path(&self, path: &str, keep_ids: &[String]) -> Result<usize> {
        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let mut stored = self.write()?;
        Ok(release(&mut stored, path, &keep))
    }

    async fn delete_path(&self, path: &str) -> Result<usize> {
        let mut stored = self.write()?;
        Ok(release(&mut stored, path, &HashSet::new()))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
