//! Durable download queue.
//!
//! One record per line: the file name, optionally followed by a status
//! suffix (`" in progress"`, `" done"`, `" failed"`). A bare name is pending.
//! There is no in-memory cache; every operation re-reads the file under an
//! exclusive advisory lock on `<jobs>.lock` and rewrites it atomically
//! (temp file + rename), so separate processes can share one queue.

use crate::error::StoreError;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Status of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Queued, not yet claimed
    Pending,
    /// Claimed by an agent
    InProgress,
    /// Downloaded and verified
    Done,
    /// Failed; needs a manual reset to retry
    Failed,
}

impl JobStatus {
    fn suffix(self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::InProgress => " in progress",
            Self::Done => " done",
            Self::Failed => " failed",
        }
    }

    /// Whether no further automatic transition happens from this status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// One record of the job file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntry {
    /// File name
    pub name: String,
    /// Current status
    pub status: JobStatus,
}

impl JobEntry {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        for status in [JobStatus::InProgress, JobStatus::Done, JobStatus::Failed] {
            if let Some(name) = line.strip_suffix(status.suffix()) {
                return Some(Self {
                    name: name.trim_end().to_string(),
                    status,
                });
            }
        }
        Some(Self {
            name: line.to_string(),
            status: JobStatus::Pending,
        })
    }

    fn render(&self) -> String {
        format!("{}{}", self.name, self.status.suffix())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// File-backed job queue
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    owners_path: PathBuf,
}

/// Marks an agent as live on a queue until dropped
#[derive(Debug)]
pub struct AgentLease {
    owners: File,
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.owners) {
            debug!("Failed to release agent lease: {}", e);
        }
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl JobStore {
    /// Open the store at `path`, creating an empty file if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;

        let lock_path = sidecar(&path, ".lock");
        let owners_path = sidecar(&path, ".owners");

        Ok(Self {
            path,
            lock_path,
            owners_path,
        })
    }

    /// Path of the job file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn locked<T>(&self, op: impl FnOnce(&mut Vec<JobEntry>) -> (T, bool)) -> Result<T, StoreError> {
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        lock.lock_exclusive()?;

        let result = self.read_entries().and_then(|mut entries| {
            let (value, dirty) = op(&mut entries);
            if dirty {
                self.write_entries(&entries)?;
            }
            Ok(value)
        });

        if let Err(e) = FileExt::unlock(&lock) {
            debug!("Failed to release job lock: {}", e);
        }
        result
    }

    fn read_entries(&self) -> Result<Vec<JobEntry>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(text.lines().filter_map(JobEntry::parse).collect())
    }

    fn write_entries(&self, entries: &[JobEntry]) -> Result<(), StoreError> {
        let tmp_path = sidecar(&self.path, ".tmp");

        {
            let mut file = File::create(&tmp_path)?;
            for entry in entries {
                writeln!(file, "{}", entry.render())?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Append pending records, skipping names already present in any status.
    ///
    /// Returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidName` for an empty name or one containing
    /// whitespace, and `StoreError::Io` on file errors.
    pub fn enqueue<I, S>(&self, names: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        for name in &names {
            validate_name(name)?;
        }

        let added = self.locked(|entries| {
            let mut added = 0;
            for name in names {
                if !entries.iter().any(|e| e.name == name) {
                    entries.push(JobEntry {
                        name,
                        status: JobStatus::Pending,
                    });
                    added += 1;
                }
            }
            (added, added > 0)
        })?;
        if added > 0 {
            info!(added, "Jobs enqueued");
        }
        Ok(added)
    }

    /// Tag every pending record `in progress` and return the claimed names.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on file errors.
    pub fn claim_pending(&self) -> Result<Vec<String>, StoreError> {
        self.locked(|entries| {
            let claimed: Vec<String> = entries
                .iter_mut()
                .filter(|e| e.status == JobStatus::Pending)
                .map(|e| {
                    e.status = JobStatus::InProgress;
                    e.name.clone()
                })
                .collect();
            let dirty = !claimed.is_empty();
            (claimed, dirty)
        })
    }

    /// Finish the first `in progress` record for `name`.
    ///
    /// Returns `false`, changing nothing, when no such record exists.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidTransition` unless `status` is `Done` or
    /// `Failed`, and `StoreError::Io` on file errors.
    pub fn mark(&self, name: &str, status: JobStatus) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition(status.to_string()));
        }
        let changed = self.locked(|entries| {
            match entries
                .iter_mut()
                .find(|e| e.name == name && e.status == JobStatus::InProgress)
            {
                Some(entry) => {
                    entry.status = status;
                    (true, true)
                }
                None => (false, false),
            }
        })?;
        if changed {
            debug!(file = %name, status = %status, "Job marked");
        }
        Ok(changed)
    }

    /// Operator reset: put every record for `name` back to pending.
    ///
    /// Returns `false` if there was nothing to reset.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on file errors.
    pub fn reset(&self, name: &str) -> Result<bool, StoreError> {
        self.locked(|entries| {
            let mut changed = false;
            for entry in entries.iter_mut().filter(|e| e.name == name) {
                if entry.status != JobStatus::Pending {
                    entry.status = JobStatus::Pending;
                    changed = true;
                }
            }
            (changed, changed)
        })
    }

    /// Register a live agent on this queue.
    ///
    /// Every running agent holds a shared lock on `<jobs>.owners` through the
    /// returned [`AgentLease`]. When `adopt_orphans` is set and no other agent
    /// holds a lease, `in progress` records can only be left over from a run
    /// that ended, so their names are handed back for this agent to finish.
    /// Adopted records stay `in progress`; nothing returns to pending here.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on file or lock errors.
    pub fn register(&self, adopt_orphans: bool) -> Result<(AgentLease, Vec<String>), StoreError> {
        let owners = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.owners_path)?;

        // Under the job lock so two starting agents cannot both see themselves alone.
        let adopted = self.locked(|entries| {
            let alone = adopt_orphans && FileExt::try_lock_exclusive(&owners).is_ok();
            let adopted: Vec<String> = if alone {
                entries
                    .iter()
                    .filter(|e| e.status == JobStatus::InProgress)
                    .map(|e| e.name.clone())
                    .collect()
            } else {
                Vec::new()
            };
            let joined = if alone {
                FileExt::unlock(&owners).and_then(|()| FileExt::lock_shared(&owners))
            } else {
                FileExt::lock_shared(&owners)
            };
            (joined.map(|()| adopted), false)
        })??;

        if !adopted.is_empty() {
            info!(jobs = adopted.len(), "Adopted orphaned jobs");
        }
        Ok((AgentLease { owners }, adopted))
    }

    /// All records in file order
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on file errors.
    pub fn entries(&self) -> Result<Vec<JobEntry>, StoreError> {
        self.locked(|entries| (entries.clone(), false))
    }

    /// Names currently `in progress`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` on file errors.
    pub fn in_progress(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.status == JobStatus::InProgress)
            .map(|e| e.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JobStore {
        JobStore::open(dir.path().join("jobs.txt")).unwrap()
    }

    #[test]
    fn test_parse_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jobs.txt"),
            "a.bin\nb.bin in progress\n\nc.bin done\nd.bin failed\n",
        )
        .unwrap();
        let s = store(&dir);

        let entries = s.entries().unwrap();
        assert_eq!(
            entries,
            vec![
                JobEntry { name: "a.bin".into(), status: JobStatus::Pending },
                JobEntry { name: "b.bin".into(), status: JobStatus::InProgress },
                JobEntry { name: "c.bin".into(), status: JobStatus::Done },
                JobEntry { name: "d.bin".into(), status: JobStatus::Failed },
            ]
        );
        assert_eq!(s.in_progress().unwrap(), vec!["b.bin".to_string()]);
    }

    #[test]
    fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);

        assert_eq!(s.enqueue(["a.bin", "b.bin", "a.bin"]).unwrap(), 2);
        assert_eq!(s.enqueue(["a.bin"]).unwrap(), 0);

        assert_eq!(s.claim_pending().unwrap(), vec!["a.bin", "b.bin"]);
        assert!(s.claim_pending().unwrap().is_empty());

        assert!(s.mark("a.bin", JobStatus::Done).unwrap());
        assert!(s.mark("b.bin", JobStatus::Failed).unwrap());

        let text = fs::read_to_string(s.path()).unwrap();
        assert_eq!(text, "a.bin done\nb.bin failed\n");
    }

    #[test]
    fn test_mark_is_noop_unless_in_progress() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.enqueue(["x.bin"]).unwrap();

        // Pending records are not finished directly.
        assert!(!s.mark("x.bin", JobStatus::Done).unwrap());
        assert!(!s.mark("unknown", JobStatus::Done).unwrap());

        s.claim_pending().unwrap();
        assert!(s.mark("x.bin", JobStatus::Done).unwrap());
        // Terminal records never move again through mark.
        assert!(!s.mark("x.bin", JobStatus::Failed).unwrap());
        assert_eq!(s.entries().unwrap()[0].status, JobStatus::Done);

        assert!(matches!(
            s.mark("x.bin", JobStatus::Pending),
            Err(StoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_reset_returns_job_to_pending() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.enqueue(["a", "b"]).unwrap();
        s.claim_pending().unwrap();
        s.mark("a", JobStatus::Failed).unwrap();

        assert!(s.reset("a").unwrap());
        assert!(!s.reset("a").unwrap());
        assert_eq!(s.claim_pending().unwrap(), vec!["a"]);
        assert_eq!(s.in_progress().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_register_adopts_orphans_in_place() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.enqueue(["x", "y"]).unwrap();
        s.claim_pending().unwrap();
        s.mark("y", JobStatus::Done).unwrap();

        let (_lease, adopted) = s.register(true).unwrap();
        assert_eq!(adopted, vec!["x".to_string()]);
        assert_eq!(fs::read_to_string(s.path()).unwrap(), "x in progress\ny done\n");
        assert!(s.claim_pending().unwrap().is_empty());
    }

    #[test]
    fn test_register_leaves_live_claims_alone() {
        let dir = TempDir::new().unwrap();
        let live = store(&dir);
        live.enqueue(["x"]).unwrap();
        let (live_lease, none) = live.register(true).unwrap();
        assert!(none.is_empty());
        assert_eq!(live.claim_pending().unwrap(), vec!["x"]);

        // A second agent on the same file while the first is running.
        let other = store(&dir);
        let (other_lease, adopted) = other.register(true).unwrap();
        assert!(adopted.is_empty());
        assert!(live.mark("x", JobStatus::Done).unwrap());
        drop(other_lease);
        drop(live_lease);

        let (_lease, adopted) = other.register(true).unwrap();
        assert!(adopted.is_empty());
        assert_eq!(fs::read_to_string(live.path()).unwrap(), "x done\n");
    }

    #[test]
    fn test_register_without_adoption_still_holds_lease() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.enqueue(["x"]).unwrap();
        s.claim_pending().unwrap();

        let (lease, adopted) = s.register(false).unwrap();
        assert!(adopted.is_empty());
        assert!(store(&dir).register(true).unwrap().1.is_empty());

        drop(lease);
        assert_eq!(store(&dir).register(true).unwrap().1, vec!["x".to_string()]);
    }

    #[test]
    fn test_rejects_unstorable_names() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert!(matches!(s.enqueue(["two words"]), Err(StoreError::InvalidName(_))));
        assert!(matches!(s.enqueue([""]), Err(StoreError::InvalidName(_))));
        assert!(s.entries().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_claims_never_overlap() {
        let dir = TempDir::new().unwrap();
        let s = Arc::new(store(&dir));
        let names: Vec<String> = (0..200).map(|i| format!("file{i}.bin")).collect();
        s.enqueue(&names).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for _ in 0..20 {
                        mine.extend(s.claim_pending().unwrap());
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for name in h.join().unwrap() {
                assert!(seen.insert(name), "claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 200);
    }
}
