//! Terminal output: progress on stderr, results on stdout.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::{ContentArrangement, Table};
use keel_core::result::RequestedBy;
use keel_core::{Reporter, ResolutionResult};
use keel_schema::{Coordinate, Version};
use std::collections::HashSet;
use std::sync::Mutex;

/// Reporter that writes one line per event to stderr.
///
/// Download progress is reduced to a single "fetching" line per artifact.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    quiet: bool,
    started: Mutex<HashSet<(Coordinate, Version)>>,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            started: Mutex::new(HashSet::new()),
        }
    }

    fn line(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{msg}");
        }
    }
}

impl Reporter for ConsoleReporter {
    fn phase(&self, title: &str) {
        self.line(&format!("{title}..."));
    }

    fn resolving(&self, coordinate: &Coordinate) {
        tracing::debug!(%coordinate, "Resolving metadata");
    }

    fn downloading(&self, coordinate: &Coordinate, version: &Version, _current: u64, total: Option<u64>) {
        let first = self
            .started
            .lock()
            .is_ok_and(|mut started| started.insert((coordinate.clone(), version.clone())));
        if first {
            let size = total.map_or_else(String::new, |t| format!(" ({})", format_size(t)));
            self.line(&format!("  ↓ {coordinate} {version}{size}"));
        }
    }

    fn cached(&self, coordinate: &Coordinate, version: &Version) {
        self.line(&format!("  • {coordinate} {version} (cached)"));
    }

    fn done(&self, coordinate: &Coordinate, version: &Version, detail: &str, size: Option<u64>) {
        let size = size.map_or_else(String::new, |s| format!(", {}", format_size(s)));
        self.line(&format!("  ✓ {coordinate} {version} ({detail}{size})"));
    }

    fn failed(&self, coordinate: &Coordinate, version: &Version, reason: &str) {
        // Failures are shown even when quiet
        eprintln!("  ✗ {coordinate} {version}: {reason}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        let noun = if count == 1 { "module" } else { "modules" };
        self.line(&format!("{action} {count} {noun} in {elapsed_secs:.2}s"));
    }
}

/// Render the result as a table, one row per component.
pub fn result_table(result: &ResolutionResult) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["module", "version", "reason", "size", "requested by"]);

    for component in result {
        let size: u64 = component.artifacts.iter().map(|a| a.size).sum();
        let requested_by = component
            .requested_by
            .iter()
            .map(RequestedBy::source_label)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            component.coordinate.to_string(),
            component.version.to_string(),
            component.reason.to_string(),
            format_size(size),
            requested_by,
        ]);
    }
    table
}

/// Format bytes for human-readable display
pub fn format_size(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    let mb = kb / 1024.0;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else if kb >= 1024.0 {
        format!("{mb:.1} MB")
    } else if kb >= 1.0 {
        format!("{kb:.1} KB")
    } else {
        format!("{bytes} B")
    }
}
