//! Two-stage retention: staged file removal, then record purge
//!
//! The guards are pure so they can be checked without touching a filesystem.

use chrono::{DateTime, Duration, Utc};

use crate::config::RetentionConfig;
use crate::types::{Lifecycle, TrackedFile};

/// Horizons beyond this are clamped
const MAX_KEEP_DAYS: u64 = 100 * 365;

/// A staged copy may go once the file reached the destination and has not
/// been removed already.
pub fn may_remove_staged(file: &TrackedFile) -> bool {
    file.lifecycle() == Lifecycle::Forwarded
}

/// A record may be purged only when it is forwarded, marked deleted and
/// the staged copy is really gone.
pub fn may_purge(file: &TrackedFile, present_in_staging: bool) -> bool {
    file.lifecycle() == Lifecycle::LocallyDeleted && !present_in_staging
}

/// Keep durations for both retention passes; `None` disables a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub file_keep: Option<Duration>,
    pub entry_keep: Option<Duration>,
}

/// Absolute cutoffs fixed at tick start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    pub file: Option<DateTime<Utc>>,
    pub entry: Option<DateTime<Utc>>,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        let days = |d: u64| Duration::days(d.min(MAX_KEEP_DAYS) as i64);
        Self {
            file_keep: config.file_keep_days.map(days),
            entry_keep: config.entry_keep_days.map(days),
        }
    }

    pub fn cutoffs(&self, now: DateTime<Utc>) -> Cutoffs {
        let back = |keep: Duration| now.checked_sub_signed(keep).unwrap_or(DateTime::UNIX_EPOCH);
        Cutoffs {
            file: self.file_keep.map(back),
            entry: self.entry_keep.map(back),
        }
    }
}
