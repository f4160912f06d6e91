use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;

/// Stable identity of a task across every state area: the descriptor's file name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskName(String);

impl TaskName {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// File name without its last extension, used to key the Run Record.
    pub(crate) fn stem(&self) -> &str {
        match self.0.rfind('.') {
            Some(index) if index > 0 => &self.0[..index],
            _ => &self.0,
        }
    }
}

impl TryFrom<String> for TaskName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err("task name must not be empty".to_string());
        }
        if value == "." || value == ".." {
            return Err(format!("task name {:?} is reserved", value));
        }
        if value.contains('/') || value.contains('\0') {
            return Err(format!("task name {:?} must be a single path component", value));
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for TaskName {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The directory a task lives in. Location is the task's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Area {
    Pending,
    Running,
    Finished,
    Failed,
}

impl Area {
    pub(crate) const ALL: [Area; 4] = [Area::Pending, Area::Running, Area::Finished, Area::Failed];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Claiming,
    Executing,
}

/// What to do with a pending task whose name already exists in another area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DuplicatePolicy {
    /// Leave it in pending and never claim it.
    #[default]
    Skip,
    /// Set the older terminal copy aside and run it again.
    Rerun,
}

/// What the startup reconciliation pass does with tasks found in running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OrphanPolicy {
    #[default]
    Requeue,
    Fail,
    Ignore,
}

impl OrphanPolicy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::Fail => "fail",
            Self::Ignore => "ignore",
        }
    }
}

/// Non-negative, finite duration in seconds.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct Seconds(f64);

impl Seconds {
    pub(crate) fn new(value: f64) -> Result<Self, String> {
        if !value.is_finite() {
            return Err(format!("must be a finite number of seconds (got {})", value));
        }
        if value < 0.0 {
            return Err(format!("must not be negative (got {})", value));
        }
        Ok(Self(value))
    }

    /// For compile-time defaults that are known to be valid.
    pub(crate) const fn constant(value: f64) -> Self {
        Self(value)
    }

    pub(crate) fn get(self) -> f64 {
        self.0
    }

    pub(crate) fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.0)
    }

    /// Zero means "never".
    pub(crate) fn as_timeout(self) -> Option<Duration> {
        if self.0 == 0.0 {
            None
        } else {
            Some(self.as_duration())
        }
    }
}

impl<'de> Deserialize<'de> for Seconds {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Seconds::new(value).map_err(D::Error::custom)
    }
}

impl std::str::FromStr for Seconds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid number of seconds: {:?}", s))?;
        Seconds::new(value)
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}
