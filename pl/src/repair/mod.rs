//! Gated repair loop
//!
//! Each round asks a suggestion source for candidate patches (several
//! requests in parallel, bounded by a worker pool and a round deadline),
//! adopts at most one candidate, and runs the validation and lint gate on the
//! result. The loop ends when the gate passes or after `max_fix_rounds`
//! rounds. Rounds are strictly sequential: round n+1 always sees the adopted
//! output of round n.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::{Plan, RawPlan};
use crate::error::{ErrorCode, PlanError, PlanErrors, Stage, StageError};
use crate::gate;
use crate::patch::{Patch, PatchApplication, apply_patch};

mod context;
mod source;

pub use context::{DocumentSummary, RepairContext};
pub use source::{SuggestionError, SuggestionSource};

#[cfg(test)]
pub use source::mock;

/// How one candidate is picked per round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// First eligible candidate in request order
    First,
    /// Trial-apply every eligible candidate and keep the best gate result
    #[default]
    FewestErrors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairConfig {
    /// Concurrent suggestion requests
    pub workers: usize,
    /// Requests issued per round
    pub requests_per_round: usize,
    pub max_fix_rounds: usize,
    /// Candidates with fewer additions plus updates are ineligible
    pub min_changes: usize,
    pub round_timeout: Duration,
    pub selection: SelectionPolicy,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            requests_per_round: 3,
            max_fix_rounds: 3,
            min_changes: 1,
            round_timeout: Duration::from_secs(180),
            selection: SelectionPolicy::default(),
        }
    }
}

/// What the loop is trying to achieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairGoal {
    pub intent: String,
    pub template: String,
    pub template_steps: Vec<String>,
}

impl RepairGoal {
    /// Expansion of every outcome root along a template's steps
    pub fn expand_with_template(template: &str, steps: &[String]) -> Self {
        Self {
            intent: format!(
                "Expand each outcome root into deliverables and ordered tasks following the '{}' template steps: {}. \
                 Fix every reported gate error.",
                template,
                steps.join(", ")
            ),
            template: template.to_string(),
            template_steps: steps.to_vec(),
        }
    }
}

/// Loop states, recorded in the outcome trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Pending,
    Generating,
    Applying,
    Gating,
    Done,
    Failed,
}

impl fmt::Display for RepairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Applying => "applying",
            Self::Gating => "gating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairFailure {
    /// Gates still fail after the last round
    Exhausted,
    /// Every request failed or returned nothing
    NoCandidates { worker_errors: Vec<String> },
    /// Candidates arrived but none met `min_changes` or applied cleanly
    NoEligibleCandidates { min_changes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairStatus {
    Done,
    Failed(RepairFailure),
}

/// Terminal result of the loop
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub status: RepairStatus,
    /// Last adopted generation (the input when nothing was adopted)
    pub document: RawPlan,
    /// The gated plan, present when `status` is `Done`
    pub plan: Option<Plan>,
    pub rounds: usize,
    pub applied: Vec<PatchApplication>,
    pub notes: Vec<String>,
    /// Gate errors of `document`; empty when it passes
    pub last_errors: Vec<PlanError>,
    pub trace: Vec<RepairState>,
}

impl RepairOutcome {
    pub fn is_done(&self) -> bool {
        self.status == RepairStatus::Done
    }

    /// Failure as structured errors; `None` when done
    ///
    /// Exhaustion carries the last gate errors verbatim so work can continue
    /// by hand.
    pub fn errors(&self) -> Option<StageError> {
        let file = self.document.file();
        let failure = match &self.status {
            RepairStatus::Done => return None,
            RepairStatus::Failed(failure) => failure,
        };

        let (code, message) = match failure {
            RepairFailure::Exhausted => (
                ErrorCode::AiExpandExhausted,
                format!("gates still failing after {} round(s)", self.rounds),
            ),
            RepairFailure::NoCandidates { worker_errors } => {
                let mut message = "suggestion source produced no proposals".to_string();
                if !worker_errors.is_empty() {
                    let shown: Vec<&str> = worker_errors.iter().take(5).map(String::as_str).collect();
                    message = format!("{} | {}", message, shown.join(" ; "));
                }
                (ErrorCode::AiExpandNoCandidates, message)
            }
            RepairFailure::NoEligibleCandidates { min_changes } => (
                ErrorCode::AiExpandNoChanges,
                format!(
                    "AI returned no edits (min_changes={}). Try increasing workers or re-running.",
                    min_changes
                ),
            ),
        };
        let mut errors = vec![PlanError::new(code, message).with_file(file).at("ai_expand")];
        if *failure == RepairFailure::Exhausted {
            errors.extend(self.last_errors.iter().cloned());
        }
        Some(StageError::new(Stage::Repair, PlanErrors::from_vec(errors)?))
    }
}

/// The gate result in loop terms
fn gate_errors(result: &Result<Plan, StageError>) -> Vec<PlanError> {
    match result {
        Ok(_) => Vec::new(),
        Err(e) => e.errors.as_slice().to_vec(),
    }
}

/// Run the loop on `document`
pub async fn run_repair(
    source: Arc<dyn SuggestionSource>,
    document: RawPlan,
    goal: &RepairGoal,
    config: &RepairConfig,
) -> RepairOutcome {
    debug!(
        workers = config.workers,
        requests = config.requests_per_round,
        max_fix_rounds = config.max_fix_rounds,
        min_changes = config.min_changes,
        selection = ?config.selection,
        "run_repair: called"
    );
    let mut trace = vec![RepairState::Pending];
    let mut current = document;
    let mut gated = gate::check(&current);
    let mut applied: Vec<PatchApplication> = Vec::new();
    let mut notes: Vec<String> = Vec::new();

    let finish = |status: RepairStatus,
                  document: RawPlan,
                  gated: Result<Plan, StageError>,
                  rounds: usize,
                  applied: Vec<PatchApplication>,
                  notes: Vec<String>,
                  mut trace: Vec<RepairState>| {
        let last_errors = gate_errors(&gated);
        trace.push(match status {
            RepairStatus::Done => RepairState::Done,
            RepairStatus::Failed(_) => RepairState::Failed,
        });
        info!(?status, rounds, applied = applied.len(), "Repair loop finished");
        RepairOutcome {
            plan: if status == RepairStatus::Done { gated.ok() } else { None },
            status,
            document,
            rounds,
            applied,
            notes,
            last_errors,
            trace,
        }
    };

    if config.max_fix_rounds == 0 {
        debug!("run_repair: no rounds allowed, gating input only");
        trace.push(RepairState::Gating);
        let status = if gated.is_ok() {
            RepairStatus::Done
        } else {
            RepairStatus::Failed(RepairFailure::Exhausted)
        };
        return finish(status, current, gated, 0, applied, notes, trace);
    }

    for round in 1..=config.max_fix_rounds {
        info!(round, max = config.max_fix_rounds, "Repair round starting");
        trace.push(RepairState::Generating);
        let context = RepairContext {
            round,
            max_rounds: config.max_fix_rounds,
            gate_errors: gate_errors(&gated),
            template: goal.template.clone(),
            template_steps: goal.template_steps.clone(),
            min_changes: config.min_changes,
            notes: notes.clone(),
            plan_summary: DocumentSummary::of(&current),
        };

        let (candidates, worker_errors) = generate(&source, &current, &goal.intent, &context, config).await;
        if candidates.is_empty() {
            warn!(round, errors = worker_errors.len(), "No candidates this round");
            let status = RepairStatus::Failed(RepairFailure::NoCandidates { worker_errors });
            return finish(status, current, gated, round, applied, notes, trace);
        }

        trace.push(RepairState::Applying);
        let Some((application, result)) = select(&current, candidates, config) else {
            warn!(round, min_changes = config.min_changes, "No eligible candidate this round");
            let status = RepairStatus::Failed(RepairFailure::NoEligibleCandidates {
                min_changes: config.min_changes,
            });
            return finish(status, current, gated, round, applied, notes, trace);
        };

        trace.push(RepairState::Gating);
        notes.extend(application.notes.iter().cloned());
        current = application.document.clone();
        applied.push(application);
        gated = result;

        if gated.is_ok() {
            info!(round, "Gates passed");
            return finish(RepairStatus::Done, current, gated, round, applied, notes, trace);
        }
        if let Err(e) = &gated {
            info!(round, stage = %e.stage, errors = e.errors.len(), "Gates still failing");
        }
    }

    let rounds = config.max_fix_rounds;
    finish(
        RepairStatus::Failed(RepairFailure::Exhausted),
        current,
        gated,
        rounds,
        applied,
        notes,
        trace,
    )
}

/// One round of concurrent suggestion requests
///
/// Candidates come back in request order regardless of completion order. A
/// failed, panicked or late request contributes nothing but an error string.
async fn generate(
    source: &Arc<dyn SuggestionSource>,
    document: &RawPlan,
    intent: &str,
    context: &RepairContext,
    config: &RepairConfig,
) -> (Vec<Patch>, Vec<String>) {
    let requests = config.requests_per_round.max(1);
    debug!(requests, workers = config.workers, "generate: called");
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut set = JoinSet::new();

    for request in 0..requests {
        let source = Arc::clone(source);
        let semaphore = Arc::clone(&semaphore);
        let document = document.clone();
        let intent = intent.to_string();
        let context = context.clone();
        set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (request, Err(SuggestionError::Other(e.to_string()))),
            };
            debug!(request, "generate: worker started");
            (request, source.propose(&document, &intent, &context).await)
        });
    }

    let deadline = tokio::time::Instant::now() + config.round_timeout;
    let mut results = Vec::with_capacity(requests);
    let mut errors = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(result))) => results.push(result),
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Suggestion worker did not finish");
                errors.push(format!("worker failed: {}", e));
            }
            Ok(None) => break,
            Err(_) => {
                warn!(pending = set.len(), timeout = ?config.round_timeout, "Round deadline reached");
                errors.push(format!("{} request(s) timed out after {:?}", set.len(), config.round_timeout));
                set.abort_all();
                break;
            }
        }
    }

    results.sort_by_key(|(request, _)| *request);
    let mut candidates = Vec::new();
    for (request, result) in results {
        match result {
            Ok(patches) => {
                debug!(request, count = patches.len(), "generate: candidates received");
                candidates.extend(patches);
            }
            Err(e) => {
                warn!(request, error = %e, "Suggestion request failed");
                errors.push(format!("request {}: {}", request, e));
            }
        }
    }
    (candidates, errors)
}

/// Pick at most one candidate and return it applied and gated
fn select(
    document: &RawPlan,
    candidates: Vec<Patch>,
    config: &RepairConfig,
) -> Option<(PatchApplication, Result<Plan, StageError>)> {
    debug!(count = candidates.len(), policy = ?config.selection, "select: called");
    let mut best: Option<(usize, PatchApplication, Result<Plan, StageError>)> = None;

    for (i, patch) in candidates.iter().enumerate() {
        if patch.change_count() < config.min_changes {
            debug!(candidate = i, changes = patch.change_count(), "select: below min_changes");
            continue;
        }
        let application = match apply_patch(document, patch) {
            Ok(application) => application,
            Err(errors) => {
                warn!(candidate = i, errors = errors.len(), "Candidate did not apply");
                continue;
            }
        };
        let result = gate::check(&application.document);
        let score = gate_errors(&result).len();
        debug!(candidate = i, score, "select: candidate gated");

        if config.selection == SelectionPolicy::First || result.is_ok() {
            return Some((application, result));
        }
        if best.as_ref().map(|(s, _, _)| score < *s).unwrap_or(true) {
            best = Some((score, application, result));
        }
    }
    best.map(|(_, application, result)| (application, result))
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedSource;
    use super::*;
    use crate::loader::{Format, parse_document};
    use serde_json::json;

    fn doc() -> RawPlan {
        parse_document(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: o, definition_of_done: [], depends_on: []}
"#,
            Format::Yaml,
            Some("plan.yaml"),
        )
        .unwrap()
    }

    fn goal() -> RepairGoal {
        RepairGoal::expand_with_template("simple", &["Design".to_string()])
    }

    fn config(rounds: usize) -> RepairConfig {
        RepairConfig {
            workers: 1,
            requests_per_round: 1,
            max_fix_rounds: rounds,
            ..Default::default()
        }
    }

    fn patch(value: serde_json::Value) -> Patch {
        Patch::from_value(&value).unwrap()
    }

    fn good_patch() -> Patch {
        patch(json!({
            "add_nodes": [{"node": {
                "id": "TSK-1", "type": "task", "title": "Design", "definition_of_done": ["done"],
                "depends_on": ["OUT-1"], "owner": "auto", "estimate_hours": 1
            }}],
            "notes": ["added design"]
        }))
    }

    /// A task without an owner: applies, but fails lint
    fn ownerless_patch(id: &str) -> Patch {
        patch(json!({
            "add_nodes": [{"node": {
                "id": id, "type": "task", "title": "t", "definition_of_done": ["x"], "depends_on": ["OUT-1"]
            }}]
        }))
    }

    fn fix_owner_patch(id: &str) -> Patch {
        patch(json!({"update_nodes": [{"id": id, "fields": {"owner": "sam"}}], "notes": ["owner"]}))
    }

    #[tokio::test]
    async fn test_done_in_one_round() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![good_patch()])]));
        let outcome = run_repair(source.clone(), doc(), &goal(), &config(3)).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.notes, vec!["added design"]);
        assert!(outcome.plan.as_ref().unwrap().contains("TSK-1"));
        assert!(outcome.errors().is_none());
        assert_eq!(
            outcome.trace,
            vec![
                RepairState::Pending,
                RepairState::Generating,
                RepairState::Applying,
                RepairState::Gating,
                RepairState::Done
            ]
        );
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gate_errors_fed_into_next_round() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(vec![ownerless_patch("T")]),
            Ok(vec![fix_owner_patch("T")]),
        ]));
        let outcome = run_repair(source.clone(), doc(), &goal(), &config(3)).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.rounds, 2);

        let contexts = source.contexts();
        assert!(contexts[0].gate_errors.is_empty());
        assert_eq!(contexts[1].round, 2);
        assert_eq!(contexts[1].gate_errors[0].code, ErrorCode::TaskMissingOwner);
        assert_eq!(contexts[1].plan_summary.node_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_surfaces_last_gate_errors() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(vec![ownerless_patch("T1")]),
            Ok(vec![ownerless_patch("T2")]),
        ]));
        let outcome = run_repair(source, doc(), &goal(), &config(2)).await;
        assert_eq!(outcome.status, RepairStatus::Failed(RepairFailure::Exhausted));
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.last_errors.len(), 2);
        assert_eq!(*outcome.trace.last().unwrap(), RepairState::Failed);

        let err = outcome.errors().unwrap();
        assert_eq!(err.stage, Stage::Repair);
        assert!(err.errors.contains(ErrorCode::AiExpandExhausted));
        assert!(err.errors.contains(ErrorCode::TaskMissingOwner));
    }

    #[tokio::test]
    async fn test_no_candidates_when_all_workers_fail() {
        let source = Arc::new(ScriptedSource::new(vec![Err("boom".to_string()), Err("bang".to_string())]));
        let cfg = RepairConfig {
            workers: 2,
            requests_per_round: 2,
            ..config(3)
        };
        let outcome = run_repair(source, doc(), &goal(), &cfg).await;
        match &outcome.status {
            RepairStatus::Failed(RepairFailure::NoCandidates { worker_errors }) => {
                assert_eq!(worker_errors.len(), 2);
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(outcome.applied.is_empty());
        let err = outcome.errors().unwrap();
        assert_eq!(err.errors.codes(), vec![ErrorCode::AiExpandNoCandidates]);
    }

    #[tokio::test]
    async fn test_min_changes_makes_candidates_ineligible() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![Patch::default()])]));
        let outcome = run_repair(source, doc(), &goal(), &config(3)).await;
        assert_eq!(
            outcome.status,
            RepairStatus::Failed(RepairFailure::NoEligibleCandidates { min_changes: 1 })
        );
        let err = outcome.errors().unwrap();
        assert_eq!(err.errors.codes(), vec![ErrorCode::AiExpandNoChanges]);
        assert_eq!(err.errors.as_slice()[0].path.as_deref(), Some("ai_expand"));
    }

    #[tokio::test]
    async fn test_zero_rounds_only_gates() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let outcome = run_repair(source.clone(), doc(), &goal(), &config(0)).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.rounds, 0);
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fewest_errors_prefers_passing_candidate() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![ownerless_patch("T"), good_patch()])]));
        let outcome = run_repair(source, doc(), &goal(), &config(1)).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.applied[0].added, vec!["TSK-1"]);
    }

    #[tokio::test]
    async fn test_first_policy_takes_first_eligible() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![ownerless_patch("T"), good_patch()])]));
        let cfg = RepairConfig {
            selection: SelectionPolicy::First,
            ..config(1)
        };
        let outcome = run_repair(source, doc(), &goal(), &cfg).await;
        assert_eq!(outcome.status, RepairStatus::Failed(RepairFailure::Exhausted));
        assert_eq!(outcome.applied[0].added, vec!["T"]);
    }

    /// Call 0 hangs, call 1 fails, later calls return a passing patch
    struct MixedSource {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SuggestionSource for MixedSource {
        async fn propose(
            &self,
            _document: &RawPlan,
            _intent: &str,
            _context: &RepairContext,
        ) -> Result<Vec<Patch>, SuggestionError> {
            match self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                0 => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![good_patch()])
                }
                1 => Err(SuggestionError::Other("upstream 500".to_string())),
                _ => Ok(vec![good_patch()]),
            }
        }
    }

    fn mixed_config() -> RepairConfig {
        RepairConfig {
            workers: 3,
            requests_per_round: 3,
            round_timeout: Duration::from_millis(200),
            ..config(1)
        }
    }

    #[tokio::test]
    async fn test_generate_survives_hung_and_failed_workers() {
        let source: Arc<dyn SuggestionSource> = Arc::new(MixedSource {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cfg = mixed_config();
        let document = doc();
        let context = RepairContext {
            round: 1,
            max_rounds: 1,
            gate_errors: Vec::new(),
            template: "simple".to_string(),
            template_steps: vec!["Design".to_string()],
            min_changes: 1,
            notes: Vec::new(),
            plan_summary: DocumentSummary::of(&document),
        };

        let (candidates, errors) = generate(&source, &document, "expand", &context, &cfg).await;

        assert_eq!(candidates.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("1 request(s) timed out")), "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("upstream 500")), "{:?}", errors);
    }

    #[tokio::test]
    async fn test_hung_worker_does_not_block_round() {
        let source = Arc::new(MixedSource {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let started = std::time::Instant::now();
        let outcome = run_repair(source, doc(), &goal(), &mixed_config()).await;

        assert!(outcome.is_done());
        assert_eq!(outcome.applied.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_rounds_never_exceed_limit() {
        let replies = (0..10).map(|i| Ok(vec![ownerless_patch(&format!("T{}", i))])).collect();
        let source = Arc::new(ScriptedSource::new(replies));
        let outcome = run_repair(source, doc(), &goal(), &config(4)).await;
        assert_eq!(outcome.rounds, 4);
        assert!(outcome.applied.len() <= 4);
    }
}
