//! Stage orchestration
//!
//! Each stage fans independent model calls out over a bounded worker pool
//! (`Semaphore` + `JoinSet`) and writes every finished record through a
//! keyed `RecordSink`, so results land on disk in completion order and an
//! aborted run keeps what it already finished.
//!
//! Cancellation: once `Shutdown` is triggered, tasks that have not started
//! their call return without calling the model; calls already in flight
//! are drained normally.

use crate::aggregate::try_aggregate;
use crate::classify::classify;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::eval::{evaluate_dataset, EvaluationOutput};
use crate::generate::{build_scenario_matrix, generate_dialog};
use crate::llm::ChatModel;
use crate::prompts::Perspective;
use crate::records::{
    load_json, save_json, AnalysisRecord, DatasetRecord, Keyed, PredictionRecord, RecordSink,
    VerifiedRecord,
};
use crate::retry::RetryPolicy;
use crate::types::{ConsensusJudgment, DialogId, RawJudgment, ROUNDS};
use crate::verify::{verify, VerifiedJudgment};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Cooperative stop flag shared by all tasks of a run
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger on the first Ctrl-C
    pub fn listen_for_ctrl_c(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining in-flight calls");
                shutdown.trigger();
            }
        });
    }
}

/// Outcome counts for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Not attempted (interrupted, or no usable input)
    pub skipped: usize,
    pub output: PathBuf,
}

impl StageSummary {
    fn for_sink<T>(total: usize, sink: &RecordSink<T>) -> Self {
        Self {
            total,
            output: sink.path().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn print(&self, stage: &str) {
        println!(
            "  {}: {} ok, {} failed, {} skipped of {} -> {}",
            stage,
            self.succeeded,
            self.failed,
            self.skipped,
            self.total,
            self.output.display()
        );
    }
}

fn log_written<T: Keyed + Serialize>(stage: &str, sink: &RecordSink<T>) {
    if sink.is_empty() {
        tracing::warn!(stage, path = %sink.path().display(), "stage wrote no records");
    } else {
        tracing::info!(stage, records = sink.len(), path = %sink.path().display(), "stage output written");
    }
}

/// Worker pool shared by one stage
struct WorkerPool<K, T> {
    limiter: Arc<Semaphore>,
    shutdown: Shutdown,
    tasks: JoinSet<(K, Option<T>)>,
}

impl<K, T> WorkerPool<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    fn new(workers: usize, shutdown: &Shutdown) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: shutdown.clone(),
            tasks: JoinSet::new(),
        }
    }

    /// Run `work` once a slot is free. The task yields `(key, None)` when
    /// shutdown was triggered before it started.
    fn spawn<F>(&mut self, key: K, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let limiter = Arc::clone(&self.limiter);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return (key, None);
            };
            if shutdown.is_triggered() {
                return (key, None);
            }
            (key, Some(work.await))
        });
    }

    /// Next finished task; panicked tasks are logged and skipped
    async fn next(&mut self) -> Option<(K, Option<T>)> {
        loop {
            match self.tasks.join_next().await? {
                Ok(done) => return Some(done),
                Err(e) => tracing::error!(error = %e, "worker task aborted"),
            }
        }
    }
}

/// Synthesize `dataset.json` from the scenario matrix
pub async fn generate_stage(
    config: &PipelineConfig,
    model: Arc<dyn ChatModel>,
    shutdown: &Shutdown,
) -> Result<StageSummary> {
    let planned = build_scenario_matrix();
    let sink = RecordSink::new(config.dataset_path());
    let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
    let mut pool = WorkerPool::new(config.workers, shutdown);
    tracing::info!(dialogs = planned.len(), model = model.name(), "generating dataset");

    for plan in planned.iter().cloned() {
        let model = Arc::clone(&model);
        let retry = Arc::clone(&retry);
        pool.spawn(plan.id.clone(), async move {
            generate_dialog(model.as_ref(), &retry, &plan).await
        });
    }

    let mut summary = StageSummary::for_sink(planned.len(), &sink);
    while let Some((id, outcome)) = pool.next().await {
        match outcome {
            Some(Ok(record)) => {
                tracing::info!(
                    dialog = %id,
                    intent = %record.ground_truth.intent,
                    scenario = %record.ground_truth.scenario,
                    "generated"
                );
                sink.insert(record)?;
                summary.succeeded += 1;
            }
            Some(Err(e)) => tracing::error!(dialog = %id, error = %e, "generation failed"),
            None => summary.skipped += 1,
        }
    }
    // includes aborted tasks, which never report back
    summary.failed = summary.total - summary.succeeded - summary.skipped;
    log_written("generate", &sink);
    Ok(summary)
}

/// Rounds collected so far for one dialog
struct PendingRounds {
    rounds: [Option<RawJudgment>; ROUNDS],
    failures: Vec<String>,
    outstanding: usize,
    interrupted: bool,
}

impl PendingRounds {
    fn new() -> Self {
        Self {
            rounds: [None, None, None],
            failures: Vec::new(),
            outstanding: ROUNDS,
            interrupted: false,
        }
    }
}

/// Turn a dialog's finished rounds into its analysis record
fn finish_dialog(id: DialogId, pending: PendingRounds, keep_raw: bool) -> AnalysisRecord {
    let rounds: Vec<RawJudgment> = pending.rounds.into_iter().flatten().collect();
    match try_aggregate(&rounds) {
        Ok(consensus) => {
            let raw = if keep_raw { rounds } else { Vec::new() };
            AnalysisRecord::analyzed(id, consensus, raw)
        }
        Err(e) => {
            let reason = if pending.failures.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", e, pending.failures.join("; "))
            };
            tracing::warn!(dialog = %id, error = %reason, "dialog left unanalyzed");
            AnalysisRecord::unanalyzed(id, reason)
        }
    }
}

/// Three-round voting analysis: `dataset.json` -> `analysis.json`
pub async fn analyze_stage(
    config: &PipelineConfig,
    model: Arc<dyn ChatModel>,
    shutdown: &Shutdown,
) -> Result<StageSummary> {
    let dataset: Vec<DatasetRecord> = load_json(&config.dataset_path())?;
    let sink = RecordSink::new(config.analysis_path());
    let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
    let mut pool = WorkerPool::new(config.workers, shutdown);
    tracing::info!(dialogs = dataset.len(), rounds = ROUNDS, model = model.name(), "analyzing dialogs");

    let mut pending: HashMap<DialogId, PendingRounds> = HashMap::new();
    for record in &dataset {
        if pending.insert(record.id.clone(), PendingRounds::new()).is_some() {
            return Err(PipelineError::DuplicateRecord(record.id.clone()));
        }
        let dialog = Arc::new(record.to_dialog());
        for (round, perspective) in Perspective::ALL.into_iter().enumerate() {
            let model = Arc::clone(&model);
            let retry = Arc::clone(&retry);
            let dialog = Arc::clone(&dialog);
            pool.spawn((record.id.clone(), round), async move {
                classify(model.as_ref(), &retry, &dialog, perspective).await
            });
        }
    }

    let mut summary = StageSummary::for_sink(dataset.len(), &sink);
    while let Some(((id, round), outcome)) = pool.next().await {
        let Some(entry) = pending.get_mut(&id) else {
            continue;
        };
        match outcome {
            Some(Ok(judgment)) => entry.rounds[round] = Some(judgment),
            Some(Err(e)) => {
                tracing::warn!(dialog = %id, round = round + 1, error = %e, "round failed");
                entry.failures.push(format!("round {}: {}", round + 1, e));
            }
            None => entry.interrupted = true,
        }
        entry.outstanding -= 1;
        if entry.outstanding > 0 {
            continue;
        }

        let Some(done) = pending.remove(&id) else {
            continue;
        };
        if done.interrupted {
            summary.skipped += 1;
            continue;
        }
        let record = finish_dialog(id, done, config.keep_raw_rounds);
        if record.consensus.is_some() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        sink.insert(record)?;
    }

    // dialogs whose rounds never reported back (aborted tasks)
    for (id, _) in pending {
        sink.insert(AnalysisRecord::unanalyzed(id, "round task aborted"))?;
        summary.failed += 1;
    }
    log_written("analyze", &sink);
    Ok(summary)
}

/// Checklist verification: `analysis.json` -> `analysis_verified.json`
pub async fn verify_stage(
    config: &PipelineConfig,
    model: Arc<dyn ChatModel>,
    shutdown: &Shutdown,
) -> Result<StageSummary> {
    let dataset: Vec<DatasetRecord> = load_json(&config.dataset_path())?;
    let analysis: Vec<AnalysisRecord> = load_json(&config.analysis_path())?;
    let sink = RecordSink::new(config.verified_path());
    let retry = Arc::new(RetryPolicy::new(config.retry.clone()));
    let mut pool = WorkerPool::new(config.workers, shutdown);

    let dialogs: HashMap<&DialogId, &DatasetRecord> = dataset.iter().map(|d| (&d.id, d)).collect();
    let mut summary = StageSummary::for_sink(analysis.len(), &sink);
    let mut pending: HashMap<DialogId, ConsensusJudgment> = HashMap::new();
    tracing::info!(records = analysis.len(), model = model.name(), "verifying consensus");

    for record in analysis {
        let Some(consensus) = record.consensus else {
            tracing::debug!(dialog = %record.id, "unanalyzed, nothing to verify");
            summary.skipped += 1;
            continue;
        };
        let Some(source) = dialogs.get(&record.id) else {
            tracing::warn!(dialog = %record.id, "analysis record has no dataset entry");
            summary.skipped += 1;
            continue;
        };
        let dialog = source.to_dialog();
        let model = Arc::clone(&model);
        let retry = Arc::clone(&retry);
        pending.insert(record.id.clone(), consensus.clone());
        pool.spawn(record.id.clone(), async move {
            verify(model.as_ref(), &retry, &dialog, &consensus).await
        });
    }

    while let Some((id, outcome)) = pool.next().await {
        let Some(consensus) = pending.remove(&id) else {
            continue;
        };
        let Some(judgment) = outcome else {
            // never verified, but the consensus still belongs in the output
            summary.skipped += 1;
            sink.insert(VerifiedRecord {
                id,
                judgment: VerifiedJudgment::unverified(&consensus, "interrupted before verification"),
            })?;
            continue;
        };
        if judgment.is_verified() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        sink.insert(VerifiedRecord { id, judgment })?;
    }

    // verification tasks that never reported back
    for (id, consensus) in pending {
        summary.failed += 1;
        sink.insert(VerifiedRecord {
            id,
            judgment: VerifiedJudgment::unverified(&consensus, "verification task aborted"),
        })?;
    }
    log_written("verify", &sink);
    Ok(summary)
}

/// Prediction files that exist, consensus first
pub fn available_prediction_files(config: &PipelineConfig) -> Vec<PathBuf> {
    [config.analysis_path(), config.verified_path()]
        .into_iter()
        .filter(|p| p.exists())
        .collect()
}

/// Evaluate one prediction file and write its evaluation next to it
pub fn evaluate_stage(config: &PipelineConfig, predictions_path: &Path) -> Result<EvaluationOutput> {
    let dataset: Vec<DatasetRecord> = load_json(&config.dataset_path())?;
    let invalid = |reason: String| PipelineError::InvalidInput {
        path: predictions_path.to_path_buf(),
        reason,
    };
    let predictions: Vec<PredictionRecord> = load_json(predictions_path).map_err(|e| match e {
        PipelineError::Json(e) => invalid(e.to_string()),
        other => other,
    })?;
    if let Some(record) = predictions.iter().find(|p| !p.has_outcome()) {
        return Err(invalid(format!(
            "record {} has neither a judgment nor an error",
            record.id()
        )));
    }

    let source = predictions_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| predictions_path.display().to_string());
    let output = evaluate_dataset(&dataset, &predictions, source);

    let out_path = config.evaluation_path_for(predictions_path);
    save_json(&out_path, &output)?;
    tracing::info!(path = %out_path.display(), "evaluation written");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::llm::mock::FnModel;
    use crate::llm::ChatRequest;
    use crate::types::{
        GroundTruth, Intent, MistakeType, QualityScore, Satisfaction, Scenario, Speaker, Turn,
    };
    use crate::verify::VerificationStatus;

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            data_dir: dir.to_path_buf(),
            workers: 3,
            retry: RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
                multiplier: 1.0,
                jitter: false,
            },
            keep_raw_rounds: true,
        }
    }

    fn write_dataset(config: &PipelineConfig, ids: &[u64]) {
        let records: Vec<DatasetRecord> = ids
            .iter()
            .map(|&id| DatasetRecord {
                id: DialogId::Number(id),
                dialog: vec![
                    Turn { speaker: Speaker::Customer, text: format!("dialog {} needs a refund", id) },
                    Turn { speaker: Speaker::Agent, text: "Refunds take 5 days.".into() },
                    Turn { speaker: Speaker::Customer, text: "Okay, thanks.".into() },
                ],
                ground_truth: GroundTruth {
                    intent: Intent::Refund,
                    satisfaction: Satisfaction::Unsatisfied,
                    quality_score: QualityScore::new(2).unwrap(),
                    scenario: Scenario::HiddenDissatisfaction,
                    agent_mistakes: [MistakeType::NoResolution].into_iter().collect(),
                },
            })
            .collect();
        save_json(&config.dataset_path(), &records).unwrap();
    }

    const NEUTRAL: &str = r#"ANSWER: {"intent": "refund", "satisfaction": "neutral", "quality_score": 3, "agent_mistakes": []}"#;
    const SATISFIED: &str = r#"ANSWER: {"intent": "refund", "satisfaction": "satisfied", "quality_score": 4, "agent_mistakes": []}"#;

    /// Rounds answer neutral, satisfied, neutral; dialog 2's strict round always fails
    fn primary() -> Arc<dyn ChatModel> {
        Arc::new(FnModel::new("primary", |request: &ChatRequest| {
            if request.system == Perspective::ExperienceEvaluator.system_prompt() {
                return Ok(SATISFIED.to_string());
            }
            if request.system == Perspective::StrictAuditor.system_prompt()
                && request.user.contains("dialog 2 needs")
            {
                return Err(PipelineError::TransientCallFailure("503".into()));
            }
            Ok(NEUTRAL.to_string())
        }))
    }

    #[tokio::test]
    async fn test_analyze_marks_failed_round_unanalyzed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config, &[1, 2, 3]);

        let summary = analyze_stage(&config, primary(), &Shutdown::new()).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);

        let records: Vec<AnalysisRecord> = load_json(&config.analysis_path()).unwrap();
        assert_eq!(records.len(), 3);
        let first = records[0].consensus.as_ref().unwrap();
        assert_eq!(first.satisfaction, Satisfaction::Neutral);
        assert_eq!(records[0].raw_rounds.len(), 3);

        let failed = &records[1];
        assert_eq!(failed.id, DialogId::Number(2));
        assert!(failed.consensus.is_none());
        assert!(failed.error.as_ref().unwrap().contains("incomplete samples"));
    }

    #[tokio::test]
    async fn test_interrupted_run_writes_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config, &[1, 2]);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let summary = analyze_stage(&config, primary(), &shutdown).await.unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.succeeded, 0);
        assert!(!config.analysis_path().exists());
    }

    #[tokio::test]
    async fn test_missing_dataset_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let result = analyze_stage(&config, primary(), &Shutdown::new()).await;
        assert!(matches!(result, Err(PipelineError::MissingInput(_))));
    }

    #[tokio::test]
    async fn test_interrupted_verify_passes_consensus_through() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config, &[1, 2, 3]);
        analyze_stage(&config, primary(), &Shutdown::new()).await.unwrap();

        let verifier: Arc<dyn ChatModel> = Arc::new(FnModel::new("verifier", |_: &ChatRequest| -> Result<String> {
            Err(PipelineError::TransientCallFailure("should not be called".into()))
        }));
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let summary = verify_stage(&config, verifier, &shutdown).await.unwrap();
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.succeeded, 0);

        let verified: Vec<VerifiedRecord> = load_json(&config.verified_path()).unwrap();
        assert_eq!(verified.len(), 2);
        for record in &verified {
            assert_eq!(record.judgment.verification_status, VerificationStatus::Unverified);
            assert!(record.judgment.error.as_deref().unwrap().contains("interrupted"));
        }

        let output = evaluate_stage(&config, &config.verified_path()).unwrap();
        assert_eq!(output.summary.metrics.evaluated, 2);
        assert_eq!(output.summary.unanalyzed, 1);
        assert_eq!(output.summary.unverified, 2);
    }

    #[test]
    fn test_evaluate_rejects_files_that_are_not_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config, &[1, 2]);

        let result = evaluate_stage(&config, &config.dataset_path());
        assert!(matches!(result, Err(PipelineError::InvalidInput { .. })));

        let legacy = dir.path().join("legacy.json");
        std::fs::write(
            &legacy,
            r#"[{"id": 1, "analysis": {"intent": "refund", "satisfaction": "neutral", "quality_score": 3}}]"#,
        )
        .unwrap();
        let result = evaluate_stage(&config, &legacy);
        assert!(matches!(result, Err(PipelineError::InvalidInput { .. })));

        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"id": 1}, {"id": 2, "error": "timeout"}]"#).unwrap();
        let err = evaluate_stage(&config, &bare).unwrap_err();
        assert!(err.to_string().contains("record 1 has neither"));
        assert!(!dir.path().join("evaluation_legacy.json").exists());
    }

    #[tokio::test]
    async fn test_verify_then_evaluate_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config, &[1, 2, 3]);
        analyze_stage(&config, primary(), &Shutdown::new()).await.unwrap();

        // dialog 3's verification is unavailable; dialog 1 gets corrected
        let verifier: Arc<dyn ChatModel> = Arc::new(FnModel::new("verifier", |request: &ChatRequest| {
            if request.user.contains("dialog 3 needs") {
                return Err(PipelineError::TransientCallFailure("timeout".into()));
            }
            Ok(r#"{"checks": [
                {"item": "no_resolution", "passed": false, "correction": {"mistake_present": true}},
                {"item": "hidden_dissatisfaction", "passed": false, "correction": {"satisfaction": "unsatisfied"}},
                {"item": "ignored_question", "passed": true},
                {"item": "unnecessary_escalation", "passed": true},
                {"item": "incorrect_info", "passed": true},
                {"item": "quality_score_consistency", "passed": false, "correction": {"quality_score": 1}}
            ]}"#
            .to_string())
        }));

        let summary = verify_stage(&config, verifier, &Shutdown::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);

        let verified: Vec<VerifiedRecord> = load_json(&config.verified_path()).unwrap();
        assert_eq!(verified.len(), 2);
        assert_eq!(verified[0].judgment.verified.satisfaction, Satisfaction::Unsatisfied);
        assert_eq!(verified[0].judgment.verified.quality_score.get(), 2);
        assert_eq!(verified[1].judgment.verification_status, VerificationStatus::Unverified);
        assert_eq!(verified[1].judgment.verified.satisfaction, Satisfaction::Neutral);

        let files = available_prediction_files(&config);
        assert_eq!(files, vec![config.analysis_path(), config.verified_path()]);

        let before = evaluate_stage(&config, &files[0]).unwrap();
        assert_eq!(before.summary.unanalyzed, 1);
        assert_eq!(before.summary.metrics.hidden_dissatisfaction_detected, 0);

        let after = evaluate_stage(&config, &files[1]).unwrap();
        assert_eq!(after.summary.unanalyzed, 1);
        assert_eq!(after.summary.unverified, 1);
        assert_eq!(after.summary.metrics.hidden_dissatisfaction_detected, 1);
        assert_eq!(after.source, "analysis_verified.json");
        assert!(dir.path().join("evaluation_analysis_verified.json").exists());
        assert!(dir.path().join("evaluation.json").exists());
    }
}
