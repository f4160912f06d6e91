use std::path::Path;

use crate::logger::Logger;
use crate::run_record::{append_status, RunRecord};
use crate::store::{ClaimableStore, MoveOutcome, StoreError};
use crate::task_types::{Area, OrphanPolicy, TaskName};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RecoveryReport {
    pub(crate) requeued: Vec<TaskName>,
    pub(crate) failed: Vec<TaskName>,
    pub(crate) ignored: Vec<TaskName>,
    /// Orphans whose move did not go through; they stay in running.
    pub(crate) errors: usize,
}

impl RecoveryReport {
    pub(crate) fn total(&self) -> usize {
        self.requeued.len() + self.failed.len() + self.ignored.len() + self.errors
    }
}

/// Startup reconciliation. Runs before any worker exists, so every task in
/// running belongs to a previous, dead pool.
pub(crate) fn reconcile_orphans<S>(
    store: &S,
    policy: OrphanPolicy,
    logs_dir: Option<&Path>,
    logger: &Logger,
) -> Result<RecoveryReport, StoreError>
where
    S: ClaimableStore + ?Sized,
{
    let orphans: Vec<TaskName> = store.list(Area::Running).collect::<Result<_, _>>()?;
    let mut report = RecoveryReport::default();

    for name in orphans {
        let target = match policy {
            OrphanPolicy::Ignore => {
                logger.log_transition(&format!("recover task={} action=ignore", name));
                report.ignored.push(name);
                continue;
            }
            OrphanPolicy::Requeue => Area::Pending,
            OrphanPolicy::Fail => Area::Failed,
        };

        if target == Area::Pending && store.contains(Area::Pending, &name) {
            // Requeueing would overwrite a fresh descriptor with the same name.
            logger.log_transition(&format!(
                "recover task={} action={} err=name_already_pending",
                name,
                policy.as_str()
            ));
            report.errors += 1;
            continue;
        }

        if target == Area::Failed {
            if let Some(dir) = logs_dir {
                let record = RunRecord::path_for(dir, &name);
                if record.is_file() {
                    if let Err(err) = append_status(&record, "ORPHANED") {
                        logger.log_transition(&format!(
                            "recover task={} run_record_error err={}",
                            name, err
                        ));
                    }
                }
            }
        }

        match store.transition(&name, Area::Running, target) {
            Ok(MoveOutcome::Moved) => {
                logger.log_transition(&format!(
                    "recover task={} action={} to={}",
                    name,
                    policy.as_str(),
                    target
                ));
                if target == Area::Pending {
                    report.requeued.push(name);
                } else {
                    report.failed.push(name);
                }
            }
            Ok(MoveOutcome::Vanished) => {}
            Err(err) => {
                logger.log_transition(&format!(
                    "recover task={} action={} err={}",
                    name,
                    policy.as_str(),
                    err
                ));
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirStore, StoreLayout};
    use std::fs;
    use tempfile::TempDir;

    fn setup(root: &Path) -> DirStore {
        let store = DirStore::open(StoreLayout {
            pending: root.join("pending"),
            running: root.join("running"),
            finished: root.join("finished"),
            failed: Some(root.join("failed")),
        })
        .expect("open store");
        fs::write(root.join("running/o1.txt"), "sleep 100\n").expect("write");
        fs::write(root.join("running/o2.txt"), "sleep 100\n").expect("write");
        store
    }

    fn name(value: &str) -> TaskName {
        TaskName::try_from(value).expect("task name")
    }

    #[test]
    fn requeue_moves_orphans_back_to_pending() {
        let temp = TempDir::new().expect("temp dir");
        let store = setup(temp.path());
        let logger = Logger::file_only(temp.path().join("runner.log"));

        let mut report =
            reconcile_orphans(&store, OrphanPolicy::Requeue, None, &logger).expect("reconcile");
        report.requeued.sort();
        assert_eq!(report.requeued, vec![name("o1.txt"), name("o2.txt")]);
        assert!(temp.path().join("pending/o1.txt").is_file());
        assert_eq!(fs::read_dir(temp.path().join("running")).expect("read").count(), 0);
    }

    #[test]
    fn fail_marks_existing_run_record() {
        let temp = TempDir::new().expect("temp dir");
        let store = setup(temp.path());
        let logs = temp.path().join("logs");
        fs::create_dir_all(&logs).expect("mkdir logs");
        fs::write(logs.join("o1.log"), "CMD: sleep 100\n\n").expect("write record");
        let logger = Logger::file_only(temp.path().join("runner.log"));

        let report = reconcile_orphans(&store, OrphanPolicy::Fail, Some(&logs), &logger)
            .expect("reconcile");
        assert_eq!(report.failed.len(), 2);
        assert!(temp.path().join("failed/o1.txt").is_file());
        let record = fs::read_to_string(logs.join("o1.log")).expect("record");
        assert!(record.ends_with("ORPHANED\n"), "got: {record}");
        assert!(!logs.join("o2.log").exists());
    }

    #[test]
    fn ignore_leaves_running_untouched() {
        let temp = TempDir::new().expect("temp dir");
        let store = setup(temp.path());
        let logger = Logger::file_only(temp.path().join("runner.log"));

        let report =
            reconcile_orphans(&store, OrphanPolicy::Ignore, None, &logger).expect("reconcile");
        assert_eq!(report.ignored.len(), 2);
        assert_eq!(report.total(), 2);
        assert!(temp.path().join("running/o1.txt").is_file());
    }

    #[test]
    fn requeue_never_overwrites_pending() {
        let temp = TempDir::new().expect("temp dir");
        let store = setup(temp.path());
        fs::write(temp.path().join("pending/o1.txt"), "fresh\n").expect("write");
        let logger = Logger::file_only(temp.path().join("runner.log"));

        let report =
            reconcile_orphans(&store, OrphanPolicy::Requeue, None, &logger).expect("reconcile");
        assert_eq!(report.errors, 1);
        assert_eq!(report.requeued, vec![name("o2.txt")]);
        assert_eq!(
            fs::read_to_string(temp.path().join("pending/o1.txt")).expect("read"),
            "fresh\n"
        );
        assert!(temp.path().join("running/o1.txt").is_file());
    }
}
