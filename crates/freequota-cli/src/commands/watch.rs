//! Watch command
//!
//! Subscribes to the cross-context path and prints every value written by
//! another process until Ctrl-C.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Local;
use freequota_core::services::quota::{EventBus, FileChangeWatcher, SyncEvent};

use super::Context;
use crate::output::{print_info, OutputFormat};

pub async fn execute(ctx: &Context) -> Result<()> {
    let sync = ctx.synchronizer();
    let Some(key) = sync.key() else {
        bail!("Nothing to watch: no tracked quota for subject {}", ctx.subject_label());
    };

    let _watcher = FileChangeWatcher::start(ctx.storage.clone(), ctx.cross_bus.clone())?;

    let format = ctx.format;
    let limit = ctx.limit;
    let subscription = ctx.cross_bus.subscribe(
        &key.storage_key(),
        Arc::new(move |event: &SyncEvent| match format {
            OutputFormat::Json => {
                let line = serde_json::json!({
                    "at": Local::now().to_rfc3339(),
                    "key": event.key,
                    "used": event.value,
                    "limit": limit,
                });
                println!("{}", line);
            }
            OutputFormat::Table => {
                println!(
                    "[{}] {} used {} of {}",
                    Local::now().format("%H:%M:%S"),
                    event.key,
                    event.value,
                    limit
                );
            }
        }),
    );

    print_info(
        &format!(
            "Watching {} in {} ({} of {} used). Press Ctrl-C to stop.",
            key,
            ctx.storage.path().display(),
            sync.used(),
            ctx.limit
        ),
        ctx.quiet,
    );

    tokio::signal::ctrl_c().await?;
    ctx.cross_bus.unsubscribe(subscription);
    Ok(())
}
