//! Tick orchestration and the scheduling loop

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use tokio::sync::watch;

use super::retention::{may_purge, may_remove_staged, Cutoffs, RetentionPolicy};
use super::schedule::Schedule;
use crate::error::{RelayError, Result};
use crate::remote::RemoteSource;
use crate::staging::LocalStaging;
use crate::storage::TrackingStore;
use crate::types::{Identity, RelativePath, TickReport, TickStage};

/// Runs discover, download, forward and clean passes against one store
pub struct SyncEngine {
    remote: Box<dyn RemoteSource>,
    staging: LocalStaging,
    db_path: PathBuf,
    name_filter: Option<Regex>,
    wait_for_destination: bool,
    retention: RetentionPolicy,
    schedule: Schedule,
    identity: Identity,
}

impl SyncEngine {
    pub fn new(
        remote: Box<dyn RemoteSource>,
        staging: LocalStaging,
        db_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote,
            staging,
            db_path: db_path.into(),
            name_filter: None,
            wait_for_destination: false,
            retention: RetentionPolicy::default(),
            schedule: Schedule::every(std::time::Duration::from_secs(60)),
            identity: Identity::current(),
        }
    }

    pub fn with_name_filter(mut self, name_filter: Option<Regex>) -> Self {
        self.name_filter = name_filter;
        self
    }

    /// Skip forwarding while the destination root exists
    pub fn with_wait_for_destination(mut self, wait: bool) -> Self {
        self.wait_for_destination = wait;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn staging(&self) -> &LocalStaging {
        &self.staging
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// One full tick. The store is opened here and closed before returning.
    pub async fn tick(&self) -> Result<TickReport> {
        let store = TrackingStore::open(&self.db_path)?;
        let result = self.tick_with_store(&store).await;
        if let Err(e) = store.close() {
            tracing::warn!(error = %e, "closing tracking store failed");
        }
        result
    }

    /// One full tick against an already open store.
    ///
    /// Per-path failures are counted and logged; stage failures other than
    /// store errors are recorded in the report. A store error ends the tick.
    pub async fn tick_with_store(&self, store: &TrackingStore) -> Result<TickReport> {
        self.tick_at(store, Utc::now()).await
    }

    /// One tick with retention cutoffs computed from `now`
    pub async fn tick_at(&self, store: &TrackingStore, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let cutoffs = self.retention.cutoffs(now);
        let mut report = TickReport::default();

        enter(TickStage::Discovering);
        let new = match self.discover(store).await {
            Ok(new) => new,
            Err(e) => {
                settle(TickStage::Discovering, Err(e), &mut report)?;
                Vec::new()
            }
        };
        report.discovered = new.len();

        enter(TickStage::Downloading);
        let downloaded = self.download_new(store, new, &mut report).await;
        settle(TickStage::Downloading, downloaded, &mut report)?;

        enter(TickStage::Forwarding);
        let forwarded = self.forward_pending(store, &mut report);
        settle(TickStage::Forwarding, forwarded, &mut report)?;

        enter(TickStage::Cleaning);
        let cleaned = self.clean(store, cutoffs, &mut report);
        settle(TickStage::Cleaning, cleaned, &mut report)?;

        enter(TickStage::Idle);
        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            discovered = report.discovered,
            downloaded = report.downloaded,
            download_failures = report.download_failures,
            forwarded = report.forwarded,
            conflicts = report.conflicts,
            forward_skipped = report.forward_skipped,
            files_removed = report.files_removed,
            records_purged = report.records_purged,
            stage_errors = report.stage_errors.len(),
            duration_ms = report.duration_ms,
            "tick complete"
        );
        Ok(report)
    }

    /// Remote paths not yet tracked
    async fn discover(&self, store: &TrackingStore) -> Result<Vec<RelativePath>> {
        let remote_set = self.remote.find(self.name_filter.as_ref()).await?;
        let known: HashSet<RelativePath> = store.all_paths()?.into_iter().collect();
        let new: Vec<RelativePath> = remote_set
            .into_iter()
            .filter(|path| !known.contains(path))
            .collect();
        if !new.is_empty() {
            tracing::info!(count = new.len(), source = %self.remote.describe(), "new remote files");
        }
        Ok(new)
    }

    async fn download_new(
        &self,
        store: &TrackingStore,
        new: Vec<RelativePath>,
        report: &mut TickReport,
    ) -> Result<()> {
        for path in new {
            if let Err(e) = self.staging.ensure_staging_dir(&path) {
                tracing::error!(path = %path, error = %e, "cannot create staging directory");
                report.download_failures += 1;
                continue;
            }
            match self.remote.download(&path, self.staging.staging_root()).await {
                Ok(local) => {
                    store.record_download(&path)?;
                    report.downloaded += 1;
                    tracing::debug!(path = %path, local = %local.display(), "downloaded");
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "download failed, retrying next tick");
                    report.download_failures += 1;
                }
            }
        }
        Ok(())
    }

    fn forward_pending(&self, store: &TrackingStore, report: &mut TickReport) -> Result<()> {
        if self.wait_for_destination && self.staging.destination_root_exists() {
            tracing::info!(
                destination = %self.staging.destination_root().display(),
                "destination root present, waiting before forwarding"
            );
            report.forward_skipped = true;
            return Ok(());
        }

        for path in store.not_forwarded()? {
            match self.staging.forward(&path) {
                Ok(_) => {
                    store.mark_forwarded(&path)?;
                    report.forwarded += 1;
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!(path = %path, error = %e, "destination exists, leaving file unforwarded");
                    report.conflicts += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "forward failed");
                    report.forward_failures += 1;
                }
            }
        }

        if report.forwarded > 0 {
            match self.staging.write_trigger(&self.identity) {
                Ok(written) => report.trigger_written = written,
                Err(e) => {
                    tracing::error!(error = %e, "writing trigger failed");
                    report.stage_errors.push(format!("trigger: {}", e));
                }
            }
        }
        Ok(())
    }

    fn clean(&self, store: &TrackingStore, cutoffs: Cutoffs, report: &mut TickReport) -> Result<()> {
        if let Some(cutoff) = cutoffs.file {
            for path in store.older_than(cutoff)? {
                let Some(file) = store.get(&path)? else {
                    continue;
                };
                if !may_remove_staged(&file) {
                    continue;
                }
                match self.staging.remove_staged_file(&path) {
                    Ok(()) => {
                        store.mark_deleted(&path)?;
                        report.files_removed += 1;
                    }
                    Err(RelayError::NotStaged(_)) => {
                        // already gone from staging; record it so the entry can be purged
                        tracing::info!(path = %path, "staged copy already missing");
                        store.mark_deleted(&path)?;
                    }
                    Err(e) => {
                        tracing::error!(path = %path, error = %e, "cannot remove staged file");
                        report.removal_failures += 1;
                    }
                }
            }
            self.staging.prune_empty_directories();
        }

        if let Some(cutoff) = cutoffs.entry {
            let mut purge = Vec::new();
            for path in store.older_than(cutoff)? {
                let Some(file) = store.get(&path)? else {
                    continue;
                };
                if may_purge(&file, self.staging.exists_in_staging(&path)) {
                    purge.push(path);
                }
            }
            if !purge.is_empty() {
                report.records_purged = store.remove(&purge)?;
                tracing::info!(count = report.records_purged, "purged tracking records");
            }
        }
        Ok(())
    }

    /// Run ticks on the schedule until `shutdown` turns true.
    ///
    /// The stop signal is only checked between ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut last_tick: Option<Instant> = None;
        let mut last_slot: Option<i64> = None;
        tracing::info!(
            interval_secs = self.schedule.interval().as_secs(),
            "scheduling loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Local::now();
            let due = last_tick.map_or(true, |t| t.elapsed() >= self.schedule.interval());
            let slot = self.schedule.slot(&now);
            let fresh_slot = slot.is_none() || slot != last_slot;

            if due && fresh_slot && self.schedule.permits(&now) {
                last_tick = Some(Instant::now());
                last_slot = slot;
                if let Err(e) = self.tick().await {
                    tracing::error!(error = %e, "tick aborted");
                }
            }

            let wait = self
                .schedule
                .next_wait(last_tick.map(|t| t.elapsed()), &Local::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("scheduling loop stopped");
        Ok(())
    }
}

fn enter(stage: TickStage) {
    tracing::debug!(stage = %stage, "tick stage");
}

/// Confine a stage failure to its stage unless it is a store error
fn settle(stage: TickStage, result: Result<()>, report: &mut TickReport) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal_for_tick() => {
            tracing::error!(stage = %stage, error = %e, "tracking store failed, ending tick");
            Err(e)
        }
        Err(e) => {
            tracing::error!(stage = %stage, error = %e, "stage failed");
            report.stage_errors.push(format!("{}: {}", stage, e));
            Ok(())
        }
    }
}
