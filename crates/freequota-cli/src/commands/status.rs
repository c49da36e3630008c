//! Status command
//!
//! Shows the local quota view without contacting the server.

use anyhow::Result;
use freequota_core::QuotaView;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{print_info, print_single, print_usage};

/// Quota row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    #[tabled(rename = "Subject")]
    pub subject: String,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Used")]
    pub used: u32,
    #[tabled(rename = "Limit")]
    pub limit: u32,
    #[tabled(rename = "Remaining")]
    pub remaining: u32,
    #[tabled(rename = "Pending")]
    pub pending: u32,
    #[tabled(rename = "Exempt")]
    pub exempt: bool,
    #[tabled(rename = "Last Sync")]
    pub last_synced: String,
}

impl StatusRow {
    pub fn new(ctx: &Context, view: &QuotaView) -> Self {
        Self {
            subject: ctx.subject_label().to_string(),
            kind: ctx.kind.to_string(),
            used: view.used,
            limit: view.limit,
            remaining: view.remaining,
            pending: view.pending,
            exempt: view.is_exempt,
            last_synced: view
                .last_synced_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn show(ctx: &Context) -> Result<()> {
    let sync = ctx.synchronizer();
    let view = sync.view();
    print_view(ctx, &view)?;

    if ctx.subject.is_none() {
        print_info("No subject given (--subject); nothing is tracked.", ctx.quiet);
    } else {
        print_usage(ctx.subject_label(), &view, ctx.quiet);
    }
    Ok(())
}

pub fn print_view(ctx: &Context, view: &QuotaView) -> Result<()> {
    print_single(&StatusRow::new(ctx, view), ctx.format)
}
