use serde::Serialize;

use crate::store::{ClaimableStore, StoreError};
use crate::task_types::{Area, TaskName};

/// Read-only snapshot of every area.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub(crate) struct StatusReport {
    pub(crate) pending: usize,
    pub(crate) running: usize,
    pub(crate) finished: usize,
    pub(crate) failed: usize,
    pub(crate) running_tasks: Vec<String>,
}

/// With no failed area, failed tasks live in finished and are counted there.
pub(crate) fn collect_status<S>(store: &S, has_failed_area: bool) -> Result<StatusReport, StoreError>
where
    S: ClaimableStore + ?Sized,
{
    let mut report = StatusReport::default();
    for area in Area::ALL {
        if area == Area::Failed && !has_failed_area {
            continue;
        }
        let mut names: Vec<TaskName> = store.list(area).collect::<Result<_, _>>()?;
        let count = names.len();
        match area {
            Area::Pending => report.pending = count,
            Area::Running => {
                report.running = count;
                names.sort();
                report.running_tasks = names.iter().map(|name| name.to_string()).collect();
            }
            Area::Finished => report.finished = count,
            Area::Failed => report.failed = count,
        }
    }
    Ok(report)
}

pub(crate) fn render_text(report: &StatusReport) -> String {
    let mut out = format!(
        "pending:  {}\nrunning:  {}\nfinished: {}\nfailed:   {}\n",
        report.pending, report.running, report.finished, report.failed
    );
    for name in &report.running_tasks {
        out.push_str(&format!("  running {}\n", name));
    }
    out
}

pub(crate) fn render_json(report: &StatusReport) -> Result<String, String> {
    serde_json::to_string_pretty(report).map_err(|err| format!("Failed to encode status: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirStore, StoreLayout};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn layout(root: &Path, failed: bool) -> StoreLayout {
        StoreLayout {
            pending: root.join("pending"),
            running: root.join("running"),
            finished: root.join("finished"),
            failed: failed.then(|| root.join("failed")),
        }
    }

    #[test]
    fn counts_each_area_and_names_running_tasks() {
        let temp = TempDir::new().expect("temp dir");
        let store = DirStore::open(layout(temp.path(), true)).expect("open store");
        for (dir, name) in [
            ("pending", "p1.txt"),
            ("pending", "p2.txt"),
            ("running", "r2.txt"),
            ("running", "r1.txt"),
            ("finished", "f1.txt"),
            ("failed", "x1.txt"),
        ] {
            fs::write(temp.path().join(dir).join(name), "true\n").expect("write task");
        }

        let report = collect_status(&store, store.has_failed_area()).expect("status");
        assert_eq!(report.pending, 2);
        assert_eq!(report.running, 2);
        assert_eq!(report.finished, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.running_tasks, vec!["r1.txt", "r2.txt"]);

        let text = render_text(&report);
        assert!(text.contains("pending:  2"), "got: {text}");
        assert!(text.contains("  running r1.txt"), "got: {text}");
    }

    #[test]
    fn json_has_every_field() {
        let report = StatusReport {
            pending: 3,
            running_tasks: vec!["a.txt".to_string()],
            running: 1,
            ..StatusReport::default()
        };
        let json = render_json(&report).expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["pending"], 3);
        assert_eq!(value["failed"], 0);
        assert_eq!(value["running_tasks"][0], "a.txt");
    }

    #[test]
    fn missing_failed_area_is_not_double_counted() {
        let temp = TempDir::new().expect("temp dir");
        let store = DirStore::open(layout(temp.path(), false)).expect("open store");
        fs::write(temp.path().join("finished/done.txt"), "true\n").expect("write task");

        let report = collect_status(&store, store.has_failed_area()).expect("status");
        assert_eq!(report.finished, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn attach_does_not_create_directories() {
        let temp = TempDir::new().expect("temp dir");
        let store = DirStore::attach(layout(temp.path(), false));
        assert!(collect_status(&store, false).is_err());
        assert!(!temp.path().join("pending").exists());
    }
}
