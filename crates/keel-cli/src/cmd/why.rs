//! Why command: trace a module back to the roots that pulled it in

use anyhow::{Result, bail};
use keel_core::ResolutionResult;
use keel_schema::Coordinate;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ResolveArgs;
use crate::cmd::context::Session;
use crate::ui::ConsoleReporter;

/// Explain why `coordinate` is part of the resolution
pub async fn why(
    coordinate: &str,
    args: &ResolveArgs,
    cache_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let target: Coordinate = coordinate.parse()?;
    let session = Session::open(args, cache_root, Arc::new(ConsoleReporter::new(true))).await?;
    let result = session.resolve(cancel).await?;

    match explain(&result, &target) {
        Some(text) => {
            print!("{text}");
            Ok(())
        }
        None => bail!("{target} is not part of the resolution"),
    }
}

/// Render the requirement tree leading to `target`, or `None` if absent.
pub fn explain(result: &ResolutionResult, target: &Coordinate) -> Option<String> {
    let component = result.get(target)?;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({})",
        component.coordinate, component.version, component.reason
    );
    let mut seen = BTreeSet::from([target.clone()]);
    write_requesters(result, target, 1, &mut seen, &mut out);
    Some(out)
}

fn write_requesters(
    result: &ResolutionResult,
    coordinate: &Coordinate,
    depth: usize,
    seen: &mut BTreeSet<Coordinate>,
    out: &mut String,
) {
    let Some(component) = result.get(coordinate) else {
        return;
    };
    let indent = "  ".repeat(depth);
    for requested in &component.requested_by {
        let constraint = &requested.requirement.constraint;
        match &requested.from {
            None => {
                let _ = writeln!(out, "{indent}└─ root requires {constraint}");
            }
            Some((parent, version)) => {
                let _ = writeln!(out, "{indent}└─ {parent} {version} requires {constraint}");
                // Cycles are printed once
                if seen.insert(parent.clone()) {
                    write_requesters(result, parent, depth + 1, seen, out);
                }
            }
        }
    }
}
