//! The Report Store: a durable index of crash reports under a database
//! directory.
//!
//! Each report is one JSON record plus one `.dmp` artifact, both named by
//! the report uuid. Records are replaced via temp file + atomic rename so a
//! crash of the supervisor itself never leaves a half-written record. The
//! store assumes a single handler process; concurrency within that process
//! is handled by per-record compare-and-swap transitions.

use crate::{protocol::Annotations, Error};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use uuid::Uuid;

/// Where a report is in its upload lifecycle.
///
/// `Uploaded` and `Abandoned` are terminal; transitions out of them are
/// rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportState {
    /// Captured and eligible for upload once its next-attempt time passes
    Pending,
    /// An upload attempt is in flight. A record found in this state when the
    /// store is opened is a leftover from an interrupted handler and is
    /// recovered to `Pending`.
    Uploading,
    Uploaded,
    /// Rejected by the collector or out of attempts; kept for operators
    /// until pruned
    Abandoned,
}

impl ReportState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Uploaded | Self::Abandoned)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CrashReport {
    pub id: Uuid,
    /// Path of the dump artifact this record describes
    pub artifact: PathBuf,
    /// Annotations as they stood at capture time
    pub annotations: Annotations,
    pub state: ReportState,
    /// Upload attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the next upload attempt may run. Persisted so backoff
    /// survives a handler restart.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

pub struct ReportStore {
    root: PathBuf,
    index: Mutex<BTreeMap<Uuid, CrashReport>>,
}

impl ReportStore {
    /// Opens (creating if needed) the database directory, loads every record
    /// in it, and recovers reports stranded in `Uploading` back to `Pending`.
    ///
    /// # Errors
    ///
    /// The directory cannot be created or is not writable, or an existing
    /// record cannot be read. Unparseable records fail the open rather than
    /// being silently dropped.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        // Probe writability up front so a misconfigured database directory
        // fails at startup, not at first crash
        let probe = root.join(".writable");
        std::fs::write(&probe, b"")?;
        std::fs::remove_file(&probe)?;

        let mut index = BTreeMap::new();

        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();

            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let contents = std::fs::read(&path)?;
            let mut report: CrashReport = serde_json::from_slice(&contents)?;

            if report.state == ReportState::Uploading {
                log::info!("recovering interrupted upload of report {}", report.id);
                report.state = ReportState::Pending;
                persist(&root, &report)?;
            }

            index.insert(report.id, report);
        }

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Where the dump artifact for `id` lives
    pub fn artifact_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.dmp"))
    }

    /// Registers a new `Pending` report whose artifact has already been
    /// written to [`Self::artifact_path`].
    pub fn create(&self, id: Uuid, annotations: Annotations) -> Result<CrashReport, Error> {
        let report = CrashReport {
            id,
            artifact: self.artifact_path(id),
            annotations,
            state: ReportState::Pending,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
        };

        persist(&self.root, &report)?;
        self.index.lock().insert(id, report.clone());

        Ok(report)
    }

    pub fn get(&self, id: Uuid) -> Option<CrashReport> {
        self.index.lock().get(&id).cloned()
    }

    /// All reports currently in `state`, ordered by id
    pub fn list(&self, state: ReportState) -> Vec<CrashReport> {
        self.index
            .lock()
            .values()
            .filter(|report| report.state == state)
            .cloned()
            .collect()
    }

    /// Moves `id` from `from` to `to` if and only if it is still in `from`.
    ///
    /// # Errors
    ///
    /// [`Error::StaleState`] when the record is no longer in `from` or `from`
    /// is terminal, [`Error::UnknownReport`] when it does not exist.
    pub fn transition(
        &self,
        id: Uuid,
        from: ReportState,
        to: ReportState,
    ) -> Result<CrashReport, Error> {
        let mut index = self.index.lock();
        let report = index.get_mut(&id).ok_or(Error::UnknownReport(id))?;

        if report.state != from || from.is_terminal() {
            return Err(Error::StaleState(id));
        }

        let mut updated = report.clone();
        updated.state = to;

        persist(&self.root, &updated)?;
        *report = updated.clone();

        Ok(updated)
    }

    /// Records a finished upload attempt: bumps the attempt count and stamps
    /// when the next one may run.
    pub fn bump_attempt(
        &self,
        id: Uuid,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<CrashReport, Error> {
        let mut index = self.index.lock();
        let report = index.get_mut(&id).ok_or(Error::UnknownReport(id))?;

        let mut updated = report.clone();
        updated.attempts += 1;
        updated.last_attempt_at = Some(Utc::now());
        updated.next_attempt_at = next_attempt_at;

        persist(&self.root, &updated)?;
        *report = updated.clone();

        Ok(updated)
    }

    /// Removes terminal reports older than `retention`, records and
    /// artifacts both. Never touches `Pending` or `Uploading` reports.
    pub fn prune(&self, retention: Duration) -> Result<usize, Error> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut index = self.index.lock();
        let doomed: Vec<Uuid> = index
            .values()
            .filter(|report| report.state.is_terminal() && report.created_at < cutoff)
            .map(|report| report.id)
            .collect();

        for id in &doomed {
            let _res = std::fs::remove_file(self.artifact_path(*id));
            std::fs::remove_file(record_path(&self.root, *id))?;
            index.remove(id);
        }

        Ok(doomed.len())
    }
}

fn record_path(root: &Path, id: Uuid) -> PathBuf {
    root.join(format!("{id}.json"))
}

/// Replaces the on-disk record via temp file + rename
fn persist(root: &Path, report: &CrashReport) -> Result<(), Error> {
    use std::io::Write;

    let tmp = root.join(format!("{}.json.tmp", report.id));

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(report)?)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, record_path(root, report.id))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn annotations() -> Annotations {
        let mut annotations = Annotations::new();
        annotations.insert("ver".to_owned(), "1.0".to_owned());
        annotations
    }

    #[test]
    fn cas_rejects_stale_transitions() {
        let td = tempfile::tempdir().unwrap();
        let store = ReportStore::open(td.path()).unwrap();

        let report = store.create(Uuid::new_v4(), annotations()).unwrap();

        store
            .transition(report.id, ReportState::Pending, ReportState::Uploading)
            .unwrap();

        // A second worker losing the race sees StaleState
        assert!(matches!(
            store.transition(report.id, ReportState::Pending, ReportState::Uploading),
            Err(Error::StaleState(id)) if id == report.id
        ));

        store
            .transition(report.id, ReportState::Uploading, ReportState::Uploaded)
            .unwrap();

        // Terminal states are final
        assert!(matches!(
            store.transition(report.id, ReportState::Uploaded, ReportState::Pending),
            Err(Error::StaleState(_))
        ));
    }

    #[test]
    fn recovers_interrupted_uploads_on_open() {
        let td = tempfile::tempdir().unwrap();

        let id = {
            let store = ReportStore::open(td.path()).unwrap();
            let report = store.create(Uuid::new_v4(), annotations()).unwrap();
            store
                .transition(report.id, ReportState::Pending, ReportState::Uploading)
                .unwrap();
            report.id
        };

        // Simulates the handler dying mid-upload
        let store = ReportStore::open(td.path()).unwrap();
        let report = store.get(id).unwrap();
        assert_eq!(report.state, ReportState::Pending);
    }

    #[test]
    fn backoff_schedule_survives_reopen() {
        let td = tempfile::tempdir().unwrap();
        let next = Utc::now() + chrono::Duration::minutes(5);

        let id = {
            let store = ReportStore::open(td.path()).unwrap();
            let report = store.create(Uuid::new_v4(), annotations()).unwrap();
            store.bump_attempt(report.id, Some(next)).unwrap();
            report.id
        };

        let store = ReportStore::open(td.path()).unwrap();
        let report = store.get(id).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.next_attempt_at, Some(next));
    }

    #[test]
    fn prunes_only_old_terminal_reports() {
        let td = tempfile::tempdir().unwrap();
        let store = ReportStore::open(td.path()).unwrap();

        let done = store.create(Uuid::new_v4(), annotations()).unwrap();
        store
            .transition(done.id, ReportState::Pending, ReportState::Uploading)
            .unwrap();
        store
            .transition(done.id, ReportState::Uploading, ReportState::Uploaded)
            .unwrap();

        let pending = store.create(Uuid::new_v4(), annotations()).unwrap();

        assert_eq!(store.prune(Duration::ZERO).unwrap(), 1);
        assert!(store.get(done.id).is_none());
        assert!(store.get(pending.id).is_some());
    }
}
