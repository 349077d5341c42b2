use crate::data::{Database, Inventory};
use crate::model::{ScanCounts, ScanScope};
use crate::reconcile::{ProbeProgressCallback, prepare_candidates, reconcile};
use crate::sources::{
    CHANNEL_PREVIEW_BASE, ChannelSource, FileSource, LinkSource, MirrorSource, SourceError,
    SourceRow, collect_links,
};
use dove_scanner::{CanonicalKey, LinkExtractor, ProbeOptions, Prober, VerificationOutcome, Verifier};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Options for one reconciliation pass
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub scope: ScanScope,
    pub links_file: Option<PathBuf>,
    /// Probes in flight at once.
    pub threads: usize,
    pub probe: ProbeOptions,
    pub channel_base_url: String,
    pub show_progress_bars: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            scope: ScanScope::All,
            links_file: None,
            threads: 4,
            probe: ProbeOptions::default(),
            channel_base_url: CHANNEL_PREVIEW_BASE.to_string(),
            show_progress_bars: false,
        }
    }
}

/// What one pass did. Counts of created/updated/deleted are zero when the
/// pass was cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub run_id: String,
    pub scope: String,
    pub links_collected: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub probed: usize,
    pub suppressed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}

impl ScanSummary {
    pub fn counts(&self) -> ScanCounts {
        ScanCounts {
            links_collected: self.links_collected,
            created: self.created,
            updated: self.updated,
            deleted: self.deleted,
        }
    }
}

/// Run a pass against the real engine; Ctrl-C before the commit cancels it.
pub async fn execute_scan(db: &Database, options: ScanOptions) -> Result<ScanSummary, SourceError> {
    let sources = build_sources(db, &options)?;
    let prober = Prober::new(options.probe.clone());
    let cancel = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    run_scan(db, &sources, &prober, &options, cancel).await
}

/// Sources for the requested scope, built from the active rows in the database
pub fn build_sources(
    db: &Database,
    options: &ScanOptions,
) -> Result<Vec<Box<dyn LinkSource>>, SourceError> {
    let extractor = Arc::new(LinkExtractor::new());
    let mut sources: Vec<Box<dyn LinkSource>> = Vec::new();

    if options.scope.includes_channels() {
        let channels = db.active_channels()?;
        if !channels.is_empty() {
            let source = ChannelSource::new(channels, extractor.clone())?
                .with_base_url(&options.channel_base_url);
            sources.push(Box::new(source));
        }
    }
    if options.scope.includes_mirrors() {
        let mirrors = db.active_mirrors()?;
        if !mirrors.is_empty() {
            sources.push(Box::new(MirrorSource::new(mirrors, extractor.clone())?));
        }
    }
    if let Some(path) = &options.links_file {
        sources.push(Box::new(FileSource::new(path.clone(), extractor)));
    }

    Ok(sources)
}

/// One full pass: collect, decode and dedup, verify, reconcile, commit.
///
/// If `cancel` resolves before the commit, nothing is written to the
/// inventory and the run is recorded as cancelled.
pub async fn run_scan<V, C>(
    db: &Database,
    sources: &[Box<dyn LinkSource>],
    verifier: &V,
    options: &ScanOptions,
    cancel: C,
) -> Result<ScanSummary, SourceError>
where
    V: Verifier + ?Sized,
    C: Future<Output = ()>,
{
    let started = Instant::now();
    let run_id = db.create_scan_run(options.scope)?;
    let mut summary = ScanSummary {
        run_id: run_id.clone(),
        scope: options.scope.as_str().to_string(),
        ..ScanSummary::default()
    };

    let progress_bar = if options.show_progress_bars {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        pb.set_message("Collecting links...");
        Some(Arc::new(pb))
    } else {
        None
    };

    let work = async {
        let collection = collect_links(sources).await;
        touch_sources(db, &collection.checked);
        summary.links_collected = collection.links.len();
        info!("Collected {} unique links", collection.links.len());

        let batch = prepare_candidates(&collection.links, &mut rand::thread_rng());
        summary.invalid = batch.invalid;
        summary.duplicates = batch.duplicates;

        let existing = db.list_inventory()?;
        info!(
            "Verifying {} stored nodes and {} new candidates",
            existing.len(),
            batch.candidates.len()
        );

        let callback = progress_bar.as_ref().map(|pb| probe_progress(pb.clone()));
        let plan = reconcile(
            existing,
            batch.candidates,
            verifier,
            options.threads,
            callback,
        )
        .await;
        Ok::<_, SourceError>(plan)
    };

    let outcome = tokio::select! {
        result = work => Some(result),
        _ = cancel => None,
    };

    let plan = match outcome {
        Some(Ok(plan)) => plan,
        Some(Err(e)) => {
            finish_progress(&progress_bar, "Scan failed");
            db.fail_scan_run(&run_id)?;
            return Err(e);
        }
        None => {
            finish_progress(&progress_bar, "Scan cancelled, nothing written");
            warn!("Scan {} cancelled before commit", run_id);
            db.cancel_scan_run(&run_id)?;
            summary.cancelled = true;
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }
    };

    if let Err(e) = db.commit(&plan) {
        finish_progress(&progress_bar, "Commit failed");
        db.fail_scan_run(&run_id)?;
        return Err(e.into());
    }

    summary.probed = plan.probed;
    summary.suppressed = plan.suppressed;
    summary.created = plan.to_create.len();
    summary.updated = plan.to_update.len();
    summary.deleted = plan.to_delete.len();
    summary.elapsed_secs = started.elapsed().as_secs_f64();
    db.complete_scan_run(&run_id, &summary.counts())?;

    finish_progress(
        &progress_bar,
        &format!(
            "Scan complete! {} created, {} updated, {} deleted",
            summary.created, summary.updated, summary.deleted
        ),
    );
    Ok(summary)
}

fn probe_progress(pb: Arc<ProgressBar>) -> ProbeProgressCallback {
    let done = Arc::new(AtomicUsize::new(0));
    let working = Arc::new(AtomicUsize::new(0));
    Arc::new(move |_key: &CanonicalKey, outcome: &VerificationOutcome| {
        let total = done.fetch_add(1, Ordering::Relaxed) + 1;
        let ok = if outcome.is_success() {
            working.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            working.load(Ordering::Relaxed)
        };
        pb.set_message(format!("Probing... {} checked, {} working", total, ok));
    })
}

fn finish_progress(progress_bar: &Option<Arc<ProgressBar>>, message: &str) {
    if let Some(pb) = progress_bar {
        pb.finish_with_message(message.to_string());
    }
}

fn touch_sources(db: &Database, rows: &[SourceRow]) {
    for row in rows {
        let result = match row {
            SourceRow::Mirror(id) => db.touch_mirror(*id),
            SourceRow::Channel(id) => db.touch_channel(*id),
        };
        if let Err(e) = result {
            warn!("Failed to record last check for {:?}: {}", row, e);
        }
    }
}
