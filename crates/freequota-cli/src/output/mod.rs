//! Output formatting
//!
//! Results go to stdout as a table or JSON. Progress and quota summaries go
//! to stderr so `--format json` stays machine-readable.

use colored::{ColoredString, Colorize};
use freequota_core::QuotaView;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Invalid format: {}. Use 'table' or 'json'", other)),
        }
    }
}

/// Write one row to stdout
pub fn print_single<T>(data: &T, format: OutputFormat) -> anyhow::Result<()>
where
    T: Serialize + Tabled,
{
    let rendered = match format {
        OutputFormat::Table => Table::new([data]).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
    };
    println!("{}", rendered);
    Ok(())
}

// ============================================================================
// Quota summary
// ============================================================================

/// How close a view is to its free limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headroom {
    Exempt,
    Plenty,
    LastOne,
    Exhausted,
}

impl Headroom {
    pub fn of(view: &QuotaView) -> Self {
        if view.is_exempt {
            Headroom::Exempt
        } else if view.used >= view.limit {
            Headroom::Exhausted
        } else if view.remaining == 1 {
            Headroom::LastOne
        } else {
            Headroom::Plenty
        }
    }
}

/// `"42: 4 of 5 used (1 left)"`, coloured by [`Headroom`]
pub fn usage_line(label: &str, view: &QuotaView) -> ColoredString {
    let text = match Headroom::of(view) {
        Headroom::Exempt => format!("{}: exempt, not metered", label),
        Headroom::Exhausted => format!("{}: {} of {} used, free limit reached", label, view.used, view.limit),
        _ => format!(
            "{}: {} of {} used ({} left)",
            label, view.used, view.limit, view.remaining
        ),
    };
    match Headroom::of(view) {
        Headroom::Exempt => text.cyan(),
        Headroom::Plenty => text.green(),
        Headroom::LastOne => text.yellow(),
        Headroom::Exhausted => text.red(),
    }
}

pub fn print_usage(label: &str, view: &QuotaView, quiet: bool) {
    if !quiet {
        eprintln!("{}", usage_line(label, view));
    }
}

// ============================================================================
// Messages (stderr)
// ============================================================================

pub fn print_success(message: &str, quiet: bool) {
    if !quiet {
        eprintln!("{}", message.green());
    }
}

/// Shown even in quiet mode
pub fn print_error(message: &str) {
    eprintln!("{}", message.red());
}

pub fn print_info(message: &str, quiet: bool) {
    if !quiet {
        eprintln!("{}", message);
    }
}
