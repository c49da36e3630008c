//! Server-backed commands
//!
//! `sync` fetches the authoritative count; `ask` performs one metered action
//! through the consume endpoint.

use anyhow::{anyhow, bail, Result};
use freequota_core::services::quota::{run_metered, MeteredOutcome, SyncOutcome};
use serde::Serialize;

use super::status::print_view;
use super::Context;
use crate::output::{print_error, print_info, print_success, print_usage, OutputFormat};

pub async fn sync(ctx: &Context) -> Result<()> {
    let sync = ctx.synchronizer();
    let source = ctx.source();

    print_info(&format!("Syncing from {} ...", source.base_url()), ctx.quiet);
    match sync.sync_with(&source).await {
        SyncOutcome::Accepted(used) => print_success(&format!("Server reports {} used", used), ctx.quiet),
        SyncOutcome::FellBack(Some(used)) => print_error(&format!(
            "Sync failed, showing last stored value ({})",
            used
        )),
        SyncOutcome::FellBack(None) => print_error("Sync failed, keeping the in-memory value"),
        SyncOutcome::Rejected => print_error("Server returned an invalid count; keeping local value"),
        SyncOutcome::Stale => print_info("A newer value was already applied", ctx.quiet),
        SyncOutcome::Skipped => print_info("Nothing to sync (exempt or no subject)", ctx.quiet),
    }
    print_view(ctx, &sync.view())
}

#[derive(Debug, Serialize)]
struct AskResult<'a> {
    status: &'a str,
    response: Option<String>,
    used: u32,
    limit: u32,
}

pub async fn ask(ctx: &Context, message: String, scope: Option<String>) -> Result<()> {
    let sync = ctx.synchronizer();
    let Some(key) = sync.key() else {
        // Exempt or anonymous: nothing to meter locally, just forward
        if ctx.subject.is_none() {
            bail!("--subject is required to ask");
        }
        let source = ctx.source().with_scope("trip_id", scope);
        let key = freequota_core::QuotaKey::new(ctx.subject_label(), ctx.kind.clone());
        let response = source.consume(&key, &message).await?;
        println!("{}", response.payload.response);
        return Ok(());
    };

    let source = ctx.source().with_scope("trip_id", scope);
    let outcome = run_metered(&sync, Some(&source), || source.consume(&key, &message)).await;
    let view = sync.view();

    let mut failure = None;
    let (status, response) = match outcome {
        MeteredOutcome::Completed { payload, .. } => ("completed", Some(payload.response)),
        MeteredOutcome::Blocked => ("blocked", None),
        MeteredOutcome::Refused { .. } => ("refused", None),
        MeteredOutcome::Failed(e) => {
            failure = Some(e);
            ("failed", None)
        }
    };

    match ctx.format {
        OutputFormat::Json => {
            let result = AskResult {
                status,
                response,
                used: view.used,
                limit: view.limit,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Table => {
            match (status, response) {
                (_, Some(text)) => println!("{}", text),
                ("blocked", None) => print_error(&format!(
                    "Free limit of {} reached; not sent.",
                    view.limit
                )),
                ("refused", None) => print_error("Server refused: free limit reached."),
                _ => {}
            }
            print_usage(ctx.subject_label(), &view, ctx.quiet);
        }
    }

    match failure {
        Some(e) => Err(anyhow!("Request failed: {}", e)),
        None => Ok(()),
    }
}
