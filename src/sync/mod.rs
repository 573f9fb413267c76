//! Synchronization pipeline
//!
//! Discover new remote files, stage them, forward them into the destination
//! tree and reclaim space under a two-stage retention policy. Progress is
//! kept in the [`TrackingStore`](crate::storage::TrackingStore), so a crash
//! at any point is healed by the next tick.

mod engine;
pub mod retention;
mod schedule;

pub use engine::SyncEngine;
pub use retention::{may_purge, may_remove_staged, RetentionPolicy};
pub use schedule::{AllowList, Schedule};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::staging::LocalStaging;
use crate::{decrypt, remote};

/// Wire an engine from configuration. Capabilities are resolved once here.
pub fn build_engine(config: &RelayConfig) -> Result<SyncEngine> {
    let remote = remote::from_config(&config.remote)?;
    let decryptor = decrypt::from_config(config.decrypt.as_ref())?;

    std::fs::create_dir_all(&config.local.staging_dir)?;
    let staging = LocalStaging::new(
        config.local.staging_dir.clone(),
        config.local.destination_dir.clone(),
    )
    .with_trigger(config.local.trigger_file.clone())
    .with_decryptor(decryptor);

    Ok(SyncEngine::new(remote, staging, config.local.database.clone())
        .with_name_filter(config.remote.compiled_filter()?)
        .with_wait_for_destination(config.local.wait_for_destination)
        .with_retention(RetentionPolicy::from_config(&config.retention))
        .with_schedule(Schedule::from_config(&config.schedule)))
}
