use chrono::{DateTime, Local, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::task_types::TaskName;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only capture of one task execution: header, job output, terminal
/// status line and timing trailer.
#[derive(Debug)]
pub(crate) struct RunRecord {
    path: PathBuf,
    file: File,
}

impl RunRecord {
    pub(crate) fn path_for(logs_dir: &Path, name: &TaskName) -> PathBuf {
        logs_dir.join(format!("{}.log", name.stem()))
    }

    /// Starts a fresh record. A record left by an earlier run of the same
    /// name is renamed aside rather than overwritten.
    pub(crate) fn create(logs_dir: &Path, name: &TaskName, command: &str) -> io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = Self::path_for(logs_dir, name);
        if path.exists() {
            let suffix = Utc::now().format("%Y%m%dT%H%M%S%.3f");
            let mut aside = path.clone().into_os_string();
            aside.push(format!(".{}", suffix));
            fs::rename(&path, PathBuf::from(aside))?;
        }
        let mut file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        write!(file, "CMD: {}\n\n", command)?;
        file.flush()?;
        Ok(Self { path, file })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Independent handle for the child's stdout and stderr. Appends land
    /// after the header because the file is opened in append mode.
    pub(crate) fn output_handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    pub(crate) fn write_status(&mut self, status: &str) -> io::Result<()> {
        write!(self.file, "\n\n{}\n", status)?;
        self.file.flush()
    }

    pub(crate) fn write_timing(
        &mut self,
        started: DateTime<Local>,
        ended: DateTime<Local>,
        elapsed: Duration,
    ) -> io::Result<()> {
        write!(
            self.file,
            "\nSTART_TS: {}\nEND_TS: {}\nDURATION_S: {:.3}\n",
            started.format(TIMESTAMP_FORMAT),
            ended.format(TIMESTAMP_FORMAT),
            elapsed.as_secs_f64()
        )?;
        self.file.flush()
    }
}

/// Adds a status line to an existing record, used by recovery for orphans.
pub(crate) fn append_status(path: &Path, status: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    write!(file, "\n\n{}\n", status)?;
    file.flush()
}
