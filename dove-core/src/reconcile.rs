// Merge one pass of verified candidates with the stored inventory

use crate::data::current_timestamp;
use crate::model::{NodeRecord, SourcedLink};
use dove_scanner::{
    CandidateLink, CanonicalKey, ParsedEndpoint, Verifier, VerificationOutcome, decode, new_label,
    rewrite_with_label,
};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called once per finished probe.
pub type ProbeProgressCallback = Arc<dyn Fn(&CanonicalKey, &VerificationOutcome) + Send + Sync>;

/// A decoded, relabelled link that won its canonical key in this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCandidate {
    pub endpoint: ParsedEndpoint,
    pub raw_link: String,
    pub remark: String,
    pub source: Option<String>,
}

impl PreparedCandidate {
    pub fn key(&self) -> CanonicalKey {
        self.endpoint.key()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<PreparedCandidate>,
    pub invalid: usize,
    pub duplicates: usize,
}

/// Decisions of one pass. Nothing is written until the plan is committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_create: Vec<NodeRecord>,
    pub to_update: Vec<NodeRecord>,
    pub to_delete: Vec<CanonicalKey>,
    /// Probes run in this pass, inventory and new candidates together.
    pub probed: usize,
    /// New candidates skipped because their key is already retained.
    pub suppressed: usize,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Decode, relabel and dedup raw links. The first link to claim a canonical
/// key wins; undecodable links are dropped.
pub fn prepare_candidates<R: Rng + ?Sized>(links: &[SourcedLink], rng: &mut R) -> CandidateBatch {
    let mut batch = CandidateBatch::default();
    let mut seen: HashSet<CanonicalKey> = HashSet::new();

    for link in links {
        let Some(candidate) = CandidateLink::detect(&link.raw) else {
            batch.invalid += 1;
            continue;
        };
        let endpoint = match decode(&candidate.raw) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("dropping undecodable link from {}: {}", link.source, e);
                batch.invalid += 1;
                continue;
            }
        };
        if !seen.insert(endpoint.key()) {
            batch.duplicates += 1;
            continue;
        }

        let remark = new_label(rng);
        let raw_link = rewrite_with_label(&candidate.raw, candidate.scheme, &remark);
        batch.candidates.push(PreparedCandidate {
            endpoint,
            raw_link,
            remark,
            source: Some(link.source.clone()),
        });
    }

    batch
}

/// Re-verify every stored record, then verify the new candidates whose key
/// is not already retained, and work out what to create, update and delete.
///
/// Every retained record carries the outcome of a probe run in this call.
pub async fn reconcile<V: Verifier + ?Sized>(
    existing: Vec<NodeRecord>,
    candidates: Vec<PreparedCandidate>,
    verifier: &V,
    concurrency: usize,
    progress: Option<ProbeProgressCallback>,
) -> ReconcilePlan {
    let concurrency = concurrency.max(1);
    let mut plan = ReconcilePlan::default();

    // Stored records first
    let mut rechecks = Vec::new();
    for record in existing {
        match decode(&record.raw_link) {
            Ok(endpoint) => rechecks.push((record, endpoint)),
            Err(e) => {
                warn!("stored link for {} no longer decodes ({}), removing", record.key, e);
                plan.to_delete.push(record.key);
            }
        }
    }
    plan.probed += rechecks.len();

    let rechecked: Vec<(NodeRecord, VerificationOutcome)> = stream::iter(rechecks)
        .map(|(record, endpoint)| {
            let progress = progress.clone();
            async move {
                let outcome = verifier.verify(&record.raw_link, &endpoint).await;
                if let Some(cb) = &progress {
                    cb(&record.key, &outcome);
                }
                (record, outcome)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut retained: HashMap<CanonicalKey, NodeRecord> = HashMap::new();
    for (mut record, outcome) in rechecked {
        if outcome.is_success() {
            record.apply_outcome(&outcome, current_timestamp());
            retained.insert(record.key.clone(), record);
        } else {
            debug!("{} failed re-verification", record.key);
            plan.to_delete.push(record.key);
        }
    }

    // New candidates, minus keys the inventory already covers
    let mut fresh = Vec::new();
    let mut claimed: HashSet<CanonicalKey> = HashSet::new();
    for candidate in candidates {
        let key = candidate.key();
        if !claimed.insert(key.clone()) {
            continue;
        }
        if retained.contains_key(&key) {
            plan.suppressed += 1;
        } else {
            fresh.push(candidate);
        }
    }
    plan.probed += fresh.len();

    let verified: Vec<(PreparedCandidate, VerificationOutcome)> = stream::iter(fresh)
        .map(|candidate| {
            let progress = progress.clone();
            async move {
                let outcome = verifier.verify(&candidate.raw_link, &candidate.endpoint).await;
                if let Some(cb) = &progress {
                    cb(&candidate.key(), &outcome);
                }
                (candidate, outcome)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (candidate, outcome) in verified {
        if !outcome.is_success() {
            continue;
        }
        plan.to_create.push(NodeRecord::verified(
            &candidate.endpoint,
            candidate.raw_link,
            Some(candidate.remark),
            candidate.source,
            &outcome,
            current_timestamp(),
        ));
    }

    plan.to_update = retained.into_values().collect();
    plan.to_create.sort_by(|a, b| a.key.cmp(&b.key));
    plan.to_update.sort_by(|a, b| a.key.cmp(&b.key));
    plan.to_delete.sort();

    info!(
        "reconciled: {} to create, {} to update, {} to delete ({} probes, {} suppressed)",
        plan.to_create.len(),
        plan.to_update.len(),
        plan.to_delete.len(),
        plan.probed,
        plan.suppressed
    );
    plan
}
