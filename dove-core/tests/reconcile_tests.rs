// Tests for reconciliation of probe results against the inventory

use async_trait::async_trait;
use dove_core::data::{Database, Inventory};
use dove_core::model::{NodeRecord, SourcedLink};
use dove_core::reconcile::{ReconcilePlan, prepare_candidates, reconcile};
use dove_scanner::{CanonicalKey, ParsedEndpoint, VerificationOutcome, Verifier, decode};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use std::sync::Mutex;
use tempfile::TempDir;

/// Hosts listed as working pass; everything else is unreachable.
struct FakeVerifier {
    working: HashSet<String>,
    probed: Mutex<Vec<String>>,
}

impl FakeVerifier {
    fn new(working: &[&str]) -> Self {
        Self {
            working: working.iter().map(|h| h.to_string()).collect(),
            probed: Mutex::new(Vec::new()),
        }
    }

    fn probed(&self) -> Vec<String> {
        let mut probed = self.probed.lock().unwrap().clone();
        probed.sort();
        probed
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn verify(&self, _raw_link: &str, endpoint: &ParsedEndpoint) -> VerificationOutcome {
        self.probed
            .lock()
            .unwrap()
            .push(format!("{}:{}", endpoint.host, endpoint.port));
        if self.working.contains(&endpoint.host) {
            VerificationOutcome::working(42, 800.0)
        } else {
            VerificationOutcome::unreachable()
        }
    }
}

fn sourced(raw: &str) -> SourcedLink {
    SourcedLink {
        raw: raw.to_string(),
        source: "mirrors".to_string(),
    }
}

fn stored(raw: &str) -> NodeRecord {
    let endpoint = decode(raw).unwrap();
    NodeRecord::verified(
        &endpoint,
        raw.to_string(),
        Some("old".to_string()),
        Some("channels".to_string()),
        &VerificationOutcome::working(100, 300.0),
        1_600_000_000,
    )
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(99)
}

fn assert_unique_keys(plan: &ReconcilePlan) {
    let mut keys = HashSet::new();
    for record in plan.to_create.iter().chain(plan.to_update.iter()) {
        assert!(keys.insert(record.key.clone()), "duplicate key {}", record.key);
    }
}

// ============================================================================
// Candidate Preparation Tests
// ============================================================================

#[test]
fn test_prepare_drops_invalid_links() {
    let links = vec![
        sourced("trojan://pw@a.example:443"),
        sourced("trojan://pw@b.example:notaport"),
        sourced("vmess://!!!!"),
        sourced("https://not-a-proxy.example"),
    ];

    let batch = prepare_candidates(&links, &mut rng());

    assert_eq!(batch.candidates.len(), 1);
    assert_eq!(batch.invalid, 3);
    assert_eq!(batch.candidates[0].endpoint.host, "a.example");
}

#[test]
fn test_prepare_first_claim_wins() {
    let links = vec![
        sourced("trojan://pw@a.example:443?sni=one.example#first"),
        sourced("trojan://pw@a.example:443?sni=two.example#second"),
    ];

    let batch = prepare_candidates(&links, &mut rng());

    assert_eq!(batch.candidates.len(), 1);
    assert_eq!(batch.duplicates, 1);
    assert!(batch.candidates[0].raw_link.contains("sni=one.example"));
}

#[test]
fn test_prepare_relabels_links() {
    let batch = prepare_candidates(&[sourced("trojan://pw@a.example:443#original")], &mut rng());
    let candidate = &batch.candidates[0];

    assert!(candidate.remark.starts_with("🕊️ freedom-"));
    assert_eq!(
        candidate.raw_link,
        format!("trojan://pw@a.example:443#{}", candidate.remark)
    );
    assert_eq!(candidate.source.as_deref(), Some("mirrors"));
    assert_eq!(decode(&candidate.raw_link).unwrap(), candidate.endpoint);
}

#[test]
fn test_prepare_is_deterministic_with_seeded_rng() {
    let links = vec![sourced("trojan://pw@a.example:443"), sourced("trojan://pw@b.example:443")];
    let a = prepare_candidates(&links, &mut rng());
    let b = prepare_candidates(&links, &mut rng());
    assert_eq!(a.candidates, b.candidates);
}

// ============================================================================
// Reconciliation Tests
// ============================================================================

#[tokio::test]
async fn test_failing_known_record_is_deleted() {
    let known = stored("trojan://pw@gone.example:443#old");
    let verifier = FakeVerifier::new(&[]);

    let plan = reconcile(vec![known.clone()], Vec::new(), &verifier, 4, None).await;

    assert!(plan.to_create.is_empty());
    assert!(plan.to_update.is_empty());
    assert_eq!(plan.to_delete, vec![known.key]);
}

#[tokio::test]
async fn test_passing_known_record_is_updated() {
    let known = stored("trojan://pw@alive.example:443#old");
    let verifier = FakeVerifier::new(&["alive.example"]);

    let plan = reconcile(vec![known.clone()], Vec::new(), &verifier, 4, None).await;

    assert_eq!(plan.to_update.len(), 1);
    let updated = &plan.to_update[0];
    assert_eq!(updated.key, known.key);
    assert!(updated.is_working);
    assert_eq!(updated.last_speed_kbps, Some(800.0));
    assert_eq!(updated.last_ping_ms, Some(42));
    assert!(updated.last_checked.unwrap() > known.last_checked.unwrap());
    assert!(plan.to_delete.is_empty());
}

#[tokio::test]
async fn test_only_successful_candidates_are_created() {
    let links = vec![
        sourced("trojan://pw@good.example:443"),
        sourced("trojan://pw@bad.example:443"),
    ];
    let batch = prepare_candidates(&links, &mut rng());
    let verifier = FakeVerifier::new(&["good.example"]);

    let plan = reconcile(Vec::new(), batch.candidates, &verifier, 2, None).await;

    assert_eq!(plan.to_create.len(), 1);
    assert_eq!(plan.to_create[0].key.host, "good.example");
    assert!(plan.to_create[0].is_working);
    assert_eq!(plan.probed, 2);
}

#[tokio::test]
async fn test_candidate_matching_retained_record_is_suppressed() {
    let known = stored("trojan://pw@alive.example:443#old");
    let batch = prepare_candidates(
        &[sourced("trojan://pw@alive.example:443?sni=x.example#new")],
        &mut rng(),
    );
    let verifier = FakeVerifier::new(&["alive.example"]);

    let plan = reconcile(vec![known.clone()], batch.candidates, &verifier, 4, None).await;

    assert!(plan.to_create.is_empty());
    assert_eq!(plan.to_update.len(), 1);
    assert_eq!(plan.to_update[0].raw_link, known.raw_link);
    assert_eq!(plan.suppressed, 1);
    // the inventory probe alone decided it
    assert_eq!(verifier.probed(), vec!["alive.example:443"]);
}

#[tokio::test]
async fn test_candidate_for_deleted_key_gets_its_own_probe() {
    let known = stored("trojan://pw@flaky.example:443#old");
    let batch = prepare_candidates(&[sourced("trojan://pw@flaky.example:443")], &mut rng());
    let verifier = FakeVerifier::new(&[]);

    let plan = reconcile(vec![known.clone()], batch.candidates, &verifier, 4, None).await;

    assert_eq!(plan.to_delete, vec![known.key]);
    assert!(plan.to_create.is_empty());
    assert_eq!(verifier.probed().len(), 2);
}

#[tokio::test]
async fn test_undecodable_stored_link_is_deleted_without_probe() {
    let mut broken = stored("trojan://pw@a.example:443");
    broken.raw_link = "trojan://garbage".to_string();
    let verifier = FakeVerifier::new(&["a.example"]);

    let plan = reconcile(vec![broken.clone()], Vec::new(), &verifier, 4, None).await;

    assert_eq!(plan.to_delete, vec![broken.key]);
    assert!(verifier.probed().is_empty());
}

#[tokio::test]
async fn test_retained_records_never_share_a_key() {
    let existing = vec![
        stored("trojan://pw@one.example:443"),
        stored("trojan://pw@two.example:443"),
        stored("trojan://pw@three.example:443"),
    ];
    let links = vec![
        sourced("trojan://pw@one.example:443#again"),
        sourced("trojan://pw@two.example:443?sni=two.example"),
        sourced("trojan://pw@four.example:443"),
        sourced("trojan://pw@four.example:443#dup"),
        sourced("trojan://pw@five.example:443"),
    ];
    let batch = prepare_candidates(&links, &mut rng());
    let verifier = FakeVerifier::new(&["one.example", "two.example", "four.example"]);

    let plan = reconcile(existing, batch.candidates, &verifier, 3, None).await;

    assert_unique_keys(&plan);
    let created: Vec<&str> = plan.to_create.iter().map(|r| r.key.host.as_str()).collect();
    let updated: Vec<&str> = plan.to_update.iter().map(|r| r.key.host.as_str()).collect();
    let deleted: Vec<&str> = plan.to_delete.iter().map(|k| k.host.as_str()).collect();
    assert_eq!(created, vec!["four.example"]);
    assert_eq!(updated, vec!["one.example", "two.example"]);
    assert_eq!(deleted, vec!["three.example"]);
}

#[tokio::test]
async fn test_working_flag_matches_this_pass() {
    let mut stale = stored("trojan://pw@down.example:443");
    stale.is_working = true;
    let existing = vec![stale, stored("trojan://pw@up.example:443")];
    let verifier = FakeVerifier::new(&["up.example"]);

    let plan = reconcile(existing, Vec::new(), &verifier, 2, None).await;

    for record in plan.to_create.iter().chain(plan.to_update.iter()) {
        assert!(record.is_working);
        assert!(verifier.working.contains(&record.key.host));
    }
    assert_eq!(plan.to_delete.len(), 1);
    assert_eq!(plan.to_delete[0].host, "down.example");
}

#[tokio::test]
async fn test_progress_callback_sees_every_probe() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let callback: dove_core::reconcile::ProbeProgressCallback =
        Arc::new(move |_key: &CanonicalKey, _outcome: &VerificationOutcome| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
    let batch = prepare_candidates(
        &[sourced("trojan://pw@a.example:443"), sourced("trojan://pw@b.example:443")],
        &mut rng(),
    );

    reconcile(
        vec![stored("trojan://pw@c.example:443")],
        batch.candidates,
        &FakeVerifier::new(&[]),
        2,
        Some(callback),
    )
    .await;

    assert_eq!(seen.load(Ordering::Relaxed), 3);
}

// ============================================================================
// End-to-end With Storage
// ============================================================================

#[tokio::test]
async fn test_two_passes_against_database() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    let links = vec![
        sourced("trojan://pw@a.example:443"),
        sourced("trojan://pw@b.example:443"),
    ];

    // first pass: both work
    let verifier = FakeVerifier::new(&["a.example", "b.example"]);
    let batch = prepare_candidates(&links, &mut rng());
    let plan = reconcile(db.list_inventory().unwrap(), batch.candidates, &verifier, 2, None).await;
    db.commit(&plan).unwrap();
    assert_eq!(db.working_links().unwrap().len(), 2);

    // second pass: b went down, same links offered again
    let verifier = FakeVerifier::new(&["a.example"]);
    let batch = prepare_candidates(&links, &mut rng());
    let plan = reconcile(db.list_inventory().unwrap(), batch.candidates, &verifier, 2, None).await;
    assert_eq!(plan.to_update.len(), 1);
    assert_eq!(plan.to_delete.len(), 1);
    assert!(plan.to_create.is_empty());
    db.commit(&plan).unwrap();

    let inventory = db.list_inventory().unwrap();
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].key.host, "a.example");
}
