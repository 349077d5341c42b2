pub mod data;
pub mod model;
pub mod reconcile;
pub mod report;
pub mod scan;
pub mod sources;

use colored::Colorize;

pub use data::{Database, Inventory};
pub use model::{Channel, Mirror, NodeRecord, ScanScope, SourcedLink};
pub use reconcile::{CandidateBatch, PreparedCandidate, ReconcilePlan, prepare_candidates, reconcile};
pub use scan::{ScanOptions, ScanSummary, execute_scan, run_scan};
pub use sources::{LinkSource, SourceError, collect_links};

const BANNER: &str = r#"
     ___
    |   \ _____ _____
    | |) / _ \ V / -_)
    |___/\___/\_/\___|
"#;

pub fn print_banner() {
    println!("{}", BANNER.bright_cyan());
    println!(
        "    {} {}\n",
        "finds proxy links that still work".dimmed(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}
