use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::task_types::{Area, TaskName};

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot initialize store directory {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a state move. Losing a race is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MoveOutcome {
    Moved,
    Vanished,
}

/// Lazy, unordered snapshot of one area. A fresh `list` call re-reads the area.
pub(crate) type Listing<'a> = Box<dyn Iterator<Item = Result<TaskName, StoreError>> + Send + 'a>;

/// Storage whose only state-changing primitive is an atomic move between areas.
///
/// `transition` must be atomic against every other caller of the same store:
/// for a given name and source area, exactly one concurrent caller sees
/// `MoveOutcome::Moved` and all others see `MoveOutcome::Vanished`.
pub(crate) trait ClaimableStore: Send + Sync {
    fn list(&self, area: Area) -> Listing<'_>;

    fn contains(&self, area: Area, name: &TaskName) -> bool;

    fn transition(&self, name: &TaskName, from: Area, to: Area) -> Result<MoveOutcome, StoreError>;

    fn try_claim(&self, name: &TaskName) -> Result<bool, StoreError> {
        Ok(self.transition(name, Area::Pending, Area::Running)? == MoveOutcome::Moved)
    }

    /// Full descriptor contents of a task.
    fn payload(&self, area: Area, name: &TaskName) -> Result<String, StoreError>;

    /// Filesystem location handed to jobs so they can read the descriptor.
    fn locate(&self, area: Area, name: &TaskName) -> PathBuf;

    /// Rename an entry within its own area, keeping it but freeing `name`.
    fn set_aside(&self, area: Area, name: &TaskName, suffix: &str) -> Result<MoveOutcome, StoreError>;

    /// Registers a pool on this store for as long as the membership lives.
    /// Stores shared by nothing else report every pool as the sole one.
    fn join_pool(&self) -> Result<PoolMembership, StoreError> {
        Ok(PoolMembership {
            lock: None,
            sole: true,
        })
    }
}

/// A pool's hold on the store. Only the sole member may treat entries in
/// running as orphans; other pools' tasks live there too.
#[derive(Debug)]
pub(crate) struct PoolMembership {
    lock: Option<(File, PathBuf)>,
    sole: bool,
}

impl PoolMembership {
    pub(crate) fn is_sole(&self) -> bool {
        self.sole
    }

    /// Trades the exclusive hold for a shared one so later pools can join.
    pub(crate) fn share(&mut self) -> Result<(), StoreError> {
        if let Some((file, path)) = &self.lock {
            file.lock_shared()
                .map_err(|err| StoreError::io("share pool lock on", path, err))?;
        }
        self.sole = false;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StoreLayout {
    pub(crate) pending: PathBuf,
    pub(crate) running: PathBuf,
    pub(crate) finished: PathBuf,
    pub(crate) failed: Option<PathBuf>,
}

/// Directory-backed store: one directory per area, `rename(2)` as the mutex.
#[derive(Debug)]
pub(crate) struct DirStore {
    layout: StoreLayout,
}

impl DirStore {
    /// Creates any missing area directories. The pending area must already be
    /// reachable or creatable; failure here is fatal for the runner.
    pub(crate) fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        let mut dirs = vec![&layout.pending, &layout.running, &layout.finished];
        if let Some(failed) = &layout.failed {
            dirs.push(failed);
        }
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|source| StoreError::Init {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self { layout })
    }

    /// Uses the layout as-is without touching the filesystem.
    pub(crate) fn attach(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub(crate) fn has_failed_area(&self) -> bool {
        self.layout.failed.is_some()
    }

    /// Failed tasks fall back to finished when no failed area is configured.
    fn dir(&self, area: Area) -> &Path {
        match area {
            Area::Pending => &self.layout.pending,
            Area::Running => &self.layout.running,
            Area::Finished => &self.layout.finished,
            Area::Failed => self.layout.failed.as_deref().unwrap_or(&self.layout.finished),
        }
    }
}

impl ClaimableStore for DirStore {
    fn list(&self, area: Area) -> Listing<'_> {
        let dir = self.dir(area).to_path_buf();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => return Box::new(std::iter::once(Err(StoreError::io("list", &dir, err)))),
        };
        Box::new(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => return Some(Err(StoreError::io("list", &dir, err))),
            };
            // Sub-directories and special files are not task descriptors.
            match entry.file_type() {
                Ok(kind) if kind.is_file() => {}
                Ok(_) => return None,
                // Entry disappeared between readdir and stat: a claim in flight.
                Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
                Err(err) => return Some(Err(StoreError::io("stat", &entry.path(), err))),
            }
            let name = entry.file_name().into_string().ok()?;
            TaskName::try_from(name).ok().map(Ok)
        }))
    }

    fn contains(&self, area: Area, name: &TaskName) -> bool {
        self.dir(area).join(name.as_str()).is_file()
    }

    fn transition(&self, name: &TaskName, from: Area, to: Area) -> Result<MoveOutcome, StoreError> {
        let src = self.dir(from).join(name.as_str());
        let dst = self.dir(to).join(name.as_str());
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(MoveOutcome::Moved),
            Err(err) if err.kind() == io::ErrorKind::NotFound && !src.exists() => {
                Ok(MoveOutcome::Vanished)
            }
            Err(err) => Err(StoreError::io("move", &src, err)),
        }
    }

    fn payload(&self, area: Area, name: &TaskName) -> Result<String, StoreError> {
        let path = self.dir(area).join(name.as_str());
        let bytes = fs::read(&path).map_err(|err| StoreError::io("read", &path, err))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn locate(&self, area: Area, name: &TaskName) -> PathBuf {
        self.dir(area).join(name.as_str())
    }

    fn set_aside(&self, area: Area, name: &TaskName, suffix: &str) -> Result<MoveOutcome, StoreError> {
        let dir = self.dir(area);
        let src = dir.join(name.as_str());
        let dst = dir.join(format!("{}.{}", name, suffix));
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(MoveOutcome::Moved),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MoveOutcome::Vanished),
            Err(err) => Err(StoreError::io("set aside", &src, err)),
        }
    }

    /// Locks the running directory itself, so no marker file shows up in any
    /// area. The first pool gets it exclusively; later ones wait for a shared
    /// hold, which also keeps them out until the first has reconciled.
    fn join_pool(&self) -> Result<PoolMembership, StoreError> {
        let path = self.layout.running.clone();
        let file = File::open(&path).map_err(|err| StoreError::io("open pool lock on", &path, err))?;
        let sole = match file.try_lock_exclusive() {
            Ok(()) => true,
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                file.lock_shared()
                    .map_err(|err| StoreError::io("wait for pool lock on", &path, err))?;
                false
            }
            Err(err) => return Err(StoreError::io("take pool lock on", &path, err)),
        };
        Ok(PoolMembership {
            lock: Some((file, path)),
            sole,
        })
    }
}
