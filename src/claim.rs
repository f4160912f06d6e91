use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;

use crate::logger::Logger;
use crate::store::{ClaimableStore, MoveOutcome, StoreError};
use crate::task_types::{Area, DuplicatePolicy, TaskName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Claimed {
    pub(crate) name: TaskName,
    /// The name already had a terminal copy that was set aside.
    pub(crate) rerun: bool,
}

/// Per-worker claim state. Exclusivity comes from the store's atomic move;
/// nothing here is shared between workers.
#[derive(Debug)]
pub(crate) struct Claimer {
    slot: usize,
    ignore: Option<Regex>,
    duplicates: DuplicatePolicy,
    warned: HashSet<TaskName>,
}

enum Candidate {
    Fresh,
    Rerun,
    Skip,
}

impl Claimer {
    pub(crate) fn new(slot: usize, ignore: Option<Regex>, duplicates: DuplicatePolicy) -> Self {
        Self {
            slot,
            ignore,
            duplicates,
            warned: HashSet::new(),
        }
    }

    /// Walk one fresh listing of pending and return the first task this worker
    /// wins. Lost races are skipped silently. A store error on one entry does
    /// not stop the walk; it is returned only when nothing could be claimed.
    pub(crate) fn claim_next<S>(
        &mut self,
        store: &S,
        logger: &Logger,
    ) -> Result<Option<Claimed>, StoreError>
    where
        S: ClaimableStore + ?Sized,
    {
        let mut first_error = None;
        for entry in store.list(Area::Pending) {
            let name = match entry {
                Ok(name) => name,
                Err(err) => {
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            if self.is_ignored(&name) {
                continue;
            }
            let rerun = match self.classify(store, &name) {
                Candidate::Fresh => false,
                Candidate::Rerun => true,
                Candidate::Skip => {
                    if self.warned.insert(name.clone()) {
                        logger.log_transition(&format!(
                            "worker={} skip_duplicate task={} policy={:?}",
                            self.slot, name, self.duplicates
                        ));
                    }
                    continue;
                }
            };
            // The older terminal copy has to leave the name before the claim,
            // or the name would live in two areas at once.
            if rerun && !set_aside_previous(store, &name, logger, self.slot) {
                continue;
            }
            match store.try_claim(&name) {
                Ok(true) => return Ok(Some(Claimed { name, rerun })),
                Ok(false) => continue,
                Err(err) => {
                    logger.log_transition(&format!(
                        "worker={} store_error op=claim task={} err={}",
                        self.slot, name, err
                    ));
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    fn is_ignored(&self, name: &TaskName) -> bool {
        self.ignore
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(name.as_str()))
    }

    fn classify<S>(&self, store: &S, name: &TaskName) -> Candidate
    where
        S: ClaimableStore + ?Sized,
    {
        // Renaming onto a running descriptor would clobber an in-flight task.
        if store.contains(Area::Running, name) {
            return Candidate::Skip;
        }
        let seen = store.contains(Area::Finished, name) || store.contains(Area::Failed, name);
        match (seen, self.duplicates) {
            (false, _) => Candidate::Fresh,
            (true, DuplicatePolicy::Rerun) => Candidate::Rerun,
            (true, DuplicatePolicy::Skip) => Candidate::Skip,
        }
    }
}

/// Returns false when an older copy could not be moved out of the way; the
/// pending task must then stay unclaimed.
fn set_aside_previous<S>(store: &S, name: &TaskName, logger: &Logger, slot: usize) -> bool
where
    S: ClaimableStore + ?Sized,
{
    let suffix = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    for area in [Area::Finished, Area::Failed] {
        match store.set_aside(area, name, &suffix) {
            Ok(MoveOutcome::Moved) => logger.log_transition(&format!(
                "worker={} set_aside task={} area={} as={}.{}",
                slot, name, area, name, suffix
            )),
            Ok(MoveOutcome::Vanished) => {}
            Err(err) => {
                logger.log_transition(&format!(
                    "worker={} store_error op=set_aside task={} err={} left_in=pending",
                    slot, name, err
                ));
                return false;
            }
        }
    }
    true
}

pub(crate) fn compile_ignore(pattern: &str) -> Result<Option<Regex>, String> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|err| format!("ignore_pattern is not a valid regex: {}", err))
}
