//! Cross-island migration over the ring topology (§4.9). Each island's
//! inbox is realized as a directory of append-only files under a shared
//! root — the contract (single-producer/single-consumer, non-blocking,
//! drop-oldest on overflow) does not require in-process shared memory, and
//! a directory of files lets islands run as separate OS processes while
//! reusing the same write-to-temp-then-rename durability idiom as [`Cache`].
//!
//! [`Cache`]: ../cache/struct.Cache.html

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use types::{Candidate, IslandId, Origin};

/// One elite shipped between islands: text, an objective snapshot (not the
/// full [`ShardResult`], to keep the wire payload small), and a hop count
/// carried for observability only — it never gates admission.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Migrant {
    pub text: String,
    pub objectives: BTreeMap<String, f64>,
    pub hop_count: u32,
}

impl Migrant {
    pub fn from_candidate(candidate: &Candidate, objectives: BTreeMap<String, f64>) -> Self {
        Self {
            text: candidate.text.clone(),
            objectives,
            hop_count: 0,
        }
    }

    /// Reconstructs a fresh [`Candidate`] at the receiving island, tagged
    /// `Migrant` origin and parented on nothing (the sending island's
    /// lineage is not preserved across the wire format).
    pub fn into_candidate(self) -> Candidate {
        let token_estimate = self.text.split_whitespace().count() as u32;
        Candidate::new(self.text, vec![], Origin::Migrant, token_estimate)
    }
}

pub struct MigrationQueue {
    root: PathBuf,
    capacity: usize,
    send_counter: std::sync::atomic::AtomicU64,
}

impl MigrationQueue {
    pub fn open(root: impl Into<PathBuf>, capacity: usize) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            capacity,
            send_counter: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn inbox_dir(&self, island: IslandId) -> PathBuf {
        self.root.join(format!("island-{}", island.0)).join("inbox")
    }

    /// Pushes a migrant batch into `to`'s inbox, non-blocking, dropping the
    /// oldest pending file if the inbox is at capacity (§4.9).
    pub fn send(&self, to: IslandId, migrants: &[Migrant]) -> std::io::Result<()> {
        if migrants.is_empty() {
            return Ok(());
        }
        let dir = self.inbox_dir(to);
        std::fs::create_dir_all(&dir)?;

        let seq = self.send_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let bytes = serde_json::to_vec(migrants).expect("migrant batch always serializes");

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(dir.join(format!("{seq:020}.json")))
            .map_err(|err| err.error)?;

        self.enforce_capacity(&dir)?;
        Ok(())
    }

    fn enforce_capacity(&self, dir: &Path) -> std::io::Result<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        entries.sort();
        while entries.len() > self.capacity {
            let oldest = entries.remove(0);
            let _ = std::fs::remove_file(&oldest);
        }
        Ok(())
    }

    /// Non-blocking drain of this island's own inbox. Corrupted entries are
    /// logged and skipped rather than failing the whole drain.
    pub fn recv(&self, own: IslandId) -> Vec<Migrant> {
        let dir = self.inbox_dir(own);
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => return Vec::new(),
        };
        files.sort();

        let mut out = Vec::new();
        for path in files {
            match std::fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<Vec<Migrant>>(&bytes) {
                    Ok(mut batch) => out.append(&mut batch),
                    Err(err) => tracing::warn!(path = %path.display(), error = %err, "dropping unreadable migration batch"),
                },
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed reading migration batch"),
            }
            let _ = std::fs::remove_file(&path);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrant(text: &str) -> Migrant {
        let mut objectives = BTreeMap::new();
        objectives.insert("quality".to_string(), 0.5);
        Migrant {
            text: text.to_string(),
            objectives,
            hop_count: 0,
        }
    }

    #[test]
    fn send_then_recv_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MigrationQueue::open(dir.path(), 10).unwrap();
        queue.send(IslandId(1), &[migrant("a"), migrant("b")]).unwrap();
        let received = queue.recv(IslandId(1));
        assert_eq!(received.len(), 2);
        assert!(queue.recv(IslandId(1)).is_empty());
    }

    #[test]
    fn overflow_drops_oldest_batches() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MigrationQueue::open(dir.path(), 2).unwrap();
        queue.send(IslandId(0), &[migrant("first")]).unwrap();
        queue.send(IslandId(0), &[migrant("second")]).unwrap();
        queue.send(IslandId(0), &[migrant("third")]).unwrap();
        let received = queue.recv(IslandId(0));
        let texts: Vec<&str> = received.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts.len(), 2);
        assert!(!texts.contains(&"first"));
    }

    #[test]
    fn empty_inbox_recv_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MigrationQueue::open(dir.path(), 10).unwrap();
        assert!(queue.recv(IslandId(3)).is_empty());
    }
}
