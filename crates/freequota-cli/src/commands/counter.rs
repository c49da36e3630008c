//! Local counter commands
//!
//! `bump`, `rollback`, and `set` mutate the shared store directly, which is
//! handy for driving other watching contexts by hand.

use anyhow::{bail, Result};

use super::status::print_view;
use super::Context;
use crate::output::{print_success, print_usage};

pub async fn bump(ctx: &Context) -> Result<()> {
    let sync = ctx.synchronizer();
    sync.increment_optimistic();
    let view = sync.view();

    print_usage(ctx.subject_label(), &view, ctx.quiet);
    print_view(ctx, &view)
}

pub async fn rollback(ctx: &Context) -> Result<()> {
    let sync = ctx.synchronizer();
    sync.rollback();
    let view = sync.view();

    print_usage(ctx.subject_label(), &view, ctx.quiet);
    print_view(ctx, &view)
}

pub async fn set(ctx: &Context, value: String) -> Result<()> {
    let sync = ctx.synchronizer();
    if !sync.update_from_server(value.as_str()) {
        if sync.key().is_none() {
            bail!("Nothing to set: no tracked quota for subject {}", ctx.subject_label());
        }
        bail!("Invalid count {:?}: expected a non-negative integer", value);
    }

    print_success(&format!("{} set to {}", ctx.subject_label(), sync.used()), ctx.quiet);
    print_view(ctx, &sync.view())
}
