//! # Metrics Store
//! Injectable storage for per-entity running statistics.
//!
//! `apply` folds every group of one batch inside a single write section, so two
//! batches touching the same entity are serialized and neither is lost. A batch
//! is folded all-or-nothing: groups are computed first, then swapped in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::engagement::{fold, AveragingMode, BatchTally, EntityMetrics};

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityMetrics>>;
    async fn all(&self) -> Result<Vec<EntityMetrics>>;
    /// Fold one batch; returns the number of entities touched.
    async fn apply(&self, tally: &BatchTally, mode: AveragingMode, now: DateTime<Utc>)
        -> Result<usize>;
    async fn clear(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Process-local store. Correct for one instance; see `SnapshotStore` for
/// state that survives restarts.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<HashMap<String, EntityMetrics>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<EntityMetrics>) -> Self {
        let map = entries
            .into_iter()
            .map(|m| (m.testimonial_id.clone(), m))
            .collect();
        Self {
            inner: RwLock::new(map),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, EntityMetrics>>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("metrics store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, EntityMetrics>>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("metrics store lock poisoned"))
    }

    fn snapshot(&self) -> Result<Vec<EntityMetrics>> {
        let mut v: Vec<EntityMetrics> = self.read()?.values().cloned().collect();
        v.sort_by(|a, b| a.testimonial_id.cmp(&b.testimonial_id));
        Ok(v)
    }

    /// Fold and return the previous values of every touched entity, so a
    /// caller can undo the batch.
    fn apply_returning_previous(
        &self,
        tally: &BatchTally,
        mode: AveragingMode,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Option<EntityMetrics>)>> {
        let mut map = self.write()?;

        let updated: Vec<(String, EntityMetrics)> = tally
            .groups
            .iter()
            .map(|(id, t)| {
                let base = map
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| EntityMetrics::empty(id.clone()));
                (id.clone(), fold(&base, t, mode, now))
            })
            .collect();

        let mut previous = Vec::with_capacity(updated.len());
        for (id, m) in updated {
            previous.push((id.clone(), map.insert(id, m)));
        }
        Ok(previous)
    }

    fn restore(&self, previous: Vec<(String, Option<EntityMetrics>)>) -> Result<()> {
        let mut map = self.write()?;
        for (id, old) in previous {
            match old {
                Some(m) => {
                    map.insert(id, m);
                }
                None => {
                    map.remove(&id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityMetrics>> {
        Ok(self.read()?.get(entity_id).cloned())
    }

    async fn all(&self) -> Result<Vec<EntityMetrics>> {
        self.snapshot()
    }

    async fn apply(
        &self,
        tally: &BatchTally,
        mode: AveragingMode,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        Ok(self.apply_returning_previous(tally, mode, now)?.len())
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// In-memory store mirrored to a JSON snapshot file after every mutation.
pub struct SnapshotStore {
    mem: InMemoryStore,
    path: PathBuf,
    // serializes fold+write so the file always reflects a committed state
    write_gate: AsyncMutex<()>,
}

impl SnapshotStore {
    /// Open (or create) a snapshot at `path`. A missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => Vec::new(),
            Ok(s) => serde_json::from_str::<Vec<EntityMetrics>>(&s)
                .with_context(|| format!("parsing metrics snapshot {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading metrics snapshot {}", path.display()))
            }
        };
        tracing::info!(
            target: "aggregate",
            path = %path.display(),
            entities = entries.len(),
            "metrics snapshot loaded"
        );
        Ok(Self {
            mem: InMemoryStore::from_entries(entries),
            path,
            write_gate: AsyncMutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.mem.snapshot()?)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming snapshot into {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for SnapshotStore {
    async fn get(&self, entity_id: &str) -> Result<Option<EntityMetrics>> {
        self.mem.get(entity_id).await
    }

    async fn all(&self) -> Result<Vec<EntityMetrics>> {
        self.mem.all().await
    }

    async fn apply(
        &self,
        tally: &BatchTally,
        mode: AveragingMode,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let previous = self.mem.apply_returning_previous(tally, mode, now)?;
        let touched = previous.len();
        if let Err(e) = self.persist().await {
            // keep memory and disk in agreement
            self.mem.restore(previous)?;
            return Err(e);
        }
        Ok(touched)
    }

    async fn clear(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.mem.clear().await?;
        self.persist().await
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::EntityTally;

    fn tally(id: &str, views: u64, conversions: u64) -> BatchTally {
        let mut t = BatchTally::default();
        t.groups.insert(
            id.to_string(),
            EntityTally {
                views,
                conversions,
                ..Default::default()
            },
        );
        t
    }

    #[tokio::test]
    async fn memory_store_accumulates() {
        let s = InMemoryStore::new();
        let now = Utc::now();
        s.apply(&tally("t1", 2, 1), AveragingMode::Cumulative, now)
            .await
            .unwrap();
        s.apply(&tally("t1", 1, 0), AveragingMode::Cumulative, now)
            .await
            .unwrap();
        let m = s.get("t1").await.unwrap().expect("t1 tracked");
        assert_eq!(m.total_views, 3);
        assert_eq!(m.total_conversions, 1);
        assert!(s.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let s = InMemoryStore::new();
        s.apply(&tally("t1", 1, 0), AveragingMode::Cumulative, Utc::now())
            .await
            .unwrap();
        s.clear().await.unwrap();
        let once = s.all().await.unwrap();
        s.clear().await.unwrap();
        let twice = s.all().await.unwrap();
        assert!(once.is_empty());
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn concurrent_batches_do_not_lose_updates() {
        let s = std::sync::Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.apply(&tally("hot", 1, 0), AveragingMode::Cumulative, Utc::now())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(s.get("hot").await.unwrap().unwrap().total_views, 32);
    }

    #[tokio::test]
    async fn snapshot_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("metrics.json");

        let s = SnapshotStore::open(&path).await.unwrap();
        s.apply(&tally("t1", 4, 1), AveragingMode::Cumulative, Utc::now())
            .await
            .unwrap();
        drop(s);

        let reopened = SnapshotStore::open(&path).await.unwrap();
        let m = reopened.get("t1").await.unwrap().expect("persisted");
        assert_eq!(m.total_views, 4);
        assert!((m.conversion_rate - 0.25).abs() < 1e-9);

        reopened.clear().await.unwrap();
        let again = SnapshotStore::open(&path).await.unwrap();
        assert!(again.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_with_saturated_dwell_time_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let mut t = BatchTally::default();
        t.groups.insert(
            "t1".to_string(),
            EntityTally {
                interactions: 2,
                time_on_element: 1.0e308,
                timed_interactions: 2,
                ..Default::default()
            },
        );

        let s = SnapshotStore::open(&path).await.unwrap();
        for _ in 0..2 {
            s.apply(&t, AveragingMode::Cumulative, Utc::now()).await.unwrap();
        }
        let live = s.get("t1").await.unwrap().expect("t1 tracked");
        assert!(live.total_time_on_element.is_finite());
        assert!(live.average_time_on_element.is_finite());
        drop(s);

        let reopened = SnapshotStore::open(&path).await.expect("snapshot stays readable");
        let m = reopened.get("t1").await.unwrap().expect("persisted");
        assert_eq!(m.total_time_on_element, f64::MAX);
        assert_eq!(m.timed_interactions, 4);
    }

    #[tokio::test]
    async fn snapshot_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(SnapshotStore::open(&path).await.is_err());
    }
}
