//! Evaluation against ground truth
//!
//! - `metrics`: pure metric computation over judged dialogs
//! - `report`: console report and multi-file comparison
//!
//! `evaluate_dataset` joins the dataset with one prediction file. Dialogs
//! without a consensus are counted as unanalyzed and left out of every
//! metric; verified records that fell back are counted as unverified but
//! still scored.

pub mod metrics;
pub mod report;

pub use metrics::{evaluate, Metrics, MistakeMetrics};
pub use report::{print_comparison, print_evaluation_report};

use crate::records::{DatasetRecord, PredictionRecord};
use crate::types::{DialogId, MistakeType};
use crate::verify::VerificationStatus;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Judged,
    Unanalyzed,
}

/// Per-dialog comparison of ground truth and prediction
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationRecord {
    pub id: DialogId,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<VerificationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satisfaction_correct: Option<bool>,
    /// predicted - true
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_delta: Option<i8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub false_positives: Vec<MistakeType>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub false_negatives: Vec<MistakeType>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationSummary {
    pub total_dialogs: usize,
    pub unanalyzed: usize,
    pub unverified: usize,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl EvaluationSummary {
    /// Strengths and weaknesses worth calling out in the report
    pub fn highlights(&self) -> (Vec<String>, Vec<String>) {
        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        let m = &self.metrics;

        if m.intent_accuracy >= 0.8 {
            strengths.push(format!("Intent accuracy {:.0}%", m.intent_accuracy * 100.0));
        } else {
            weaknesses.push(format!("Intent accuracy only {:.0}%", m.intent_accuracy * 100.0));
        }

        if m.hidden_dissatisfaction_total > 0 {
            let line = format!(
                "Hidden dissatisfaction caught in {}/{} dialogs",
                m.hidden_dissatisfaction_detected, m.hidden_dissatisfaction_total
            );
            if m.hidden_dissatisfaction_recall >= 0.7 {
                strengths.push(line);
            } else {
                weaknesses.push(line);
            }
        }

        if let Some((worst, metrics)) = m
            .mistakes
            .iter()
            .filter(|(_, mm)| mm.tp + mm.fn_ > 0)
            .min_by(|a, b| a.1.f1.total_cmp(&b.1.f1))
        {
            if metrics.f1 < 0.5 {
                weaknesses.push(format!("Weak {} detection (F1 {:.2})", worst, metrics.f1));
            }
        }

        if self.unanalyzed > 0 {
            weaknesses.push(format!("{} dialogs left unanalyzed", self.unanalyzed));
        }
        if self.unverified > 0 {
            weaknesses.push(format!("{} dialogs could not be verified", self.unverified));
        }

        (strengths, weaknesses)
    }
}

/// Contents of `evaluation*.json`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationOutput {
    pub generated_at: String,
    /// Prediction file this evaluation was computed from
    pub source: String,
    pub per_dialog: Vec<EvaluationRecord>,
    pub summary: EvaluationSummary,
}

/// Score one prediction file against the dataset
pub fn evaluate_dataset(
    dataset: &[DatasetRecord],
    predictions: &[PredictionRecord],
    source: impl Into<String>,
) -> EvaluationOutput {
    let by_id: HashMap<&DialogId, &PredictionRecord> =
        predictions.iter().map(|p| (p.id(), p)).collect();

    let known: std::collections::HashSet<&DialogId> = dataset.iter().map(|d| &d.id).collect();
    let orphans = predictions.iter().filter(|p| !known.contains(p.id())).count();
    if orphans > 0 {
        tracing::warn!(orphans, "predictions without a dataset entry ignored");
    }

    let mut judged = Vec::new();
    let mut per_dialog = Vec::with_capacity(dataset.len());
    let mut unverified = 0;

    for record in dataset {
        let prediction = by_id.get(&record.id).copied();
        let verification_status = prediction.and_then(|p| p.verification_status());

        let Some(predicted) = prediction.and_then(|p| p.prediction()) else {
            per_dialog.push(EvaluationRecord {
                id: record.id.clone(),
                status: RecordStatus::Unanalyzed,
                verification_status,
                intent_correct: None,
                satisfaction_correct: None,
                score_delta: None,
                false_positives: Vec::new(),
                false_negatives: Vec::new(),
            });
            continue;
        };

        if verification_status == Some(VerificationStatus::Unverified) {
            unverified += 1;
        }

        let truth = &record.ground_truth;
        let score_delta = predicted.quality_score.get() as i8 - truth.quality_score.get() as i8;
        per_dialog.push(EvaluationRecord {
            id: record.id.clone(),
            status: RecordStatus::Judged,
            verification_status,
            intent_correct: Some(truth.intent == predicted.intent),
            satisfaction_correct: Some(truth.satisfaction == predicted.satisfaction),
            score_delta: Some(score_delta),
            false_positives: predicted
                .agent_mistakes
                .difference(&truth.agent_mistakes)
                .copied()
                .collect(),
            false_negatives: truth
                .agent_mistakes
                .difference(&predicted.agent_mistakes)
                .copied()
                .collect(),
        });
        judged.push((truth.clone(), predicted.clone()));
    }

    let metrics = evaluate(&judged);
    EvaluationOutput {
        generated_at: chrono::Utc::now().to_rfc3339(),
        source: source.into(),
        summary: EvaluationSummary {
            total_dialogs: dataset.len(),
            unanalyzed: dataset.len() - metrics.evaluated,
            unverified,
            metrics,
        },
        per_dialog,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AnalysisRecord, VerifiedRecord};
    use crate::types::{
        ConsensusJudgment, GroundTruth, Intent, QualityScore, Satisfaction, Scenario, Speaker, Turn,
    };
    use crate::verify::VerifiedJudgment;

    fn dataset_record(id: u64, scenario: Scenario, satisfaction: Satisfaction) -> DatasetRecord {
        DatasetRecord {
            id: DialogId::Number(id),
            dialog: vec![Turn { speaker: Speaker::Customer, text: "hello".into() }],
            ground_truth: GroundTruth {
                intent: Intent::Refund,
                satisfaction,
                quality_score: QualityScore::new(2).unwrap(),
                scenario,
                agent_mistakes: [MistakeType::NoResolution].into_iter().collect(),
            },
        }
    }

    fn consensus(satisfaction: Satisfaction) -> ConsensusJudgment {
        ConsensusJudgment {
            intent: Intent::Refund,
            satisfaction,
            quality_score: QualityScore::new(3).unwrap(),
            agent_mistakes: [MistakeType::RudeTone].into_iter().collect(),
        }
    }

    #[test]
    fn test_unanalyzed_dialogs_are_counted_not_scored() {
        let dataset = vec![
            dataset_record(1, Scenario::Problematic, Satisfaction::Neutral),
            dataset_record(2, Scenario::Problematic, Satisfaction::Neutral),
            dataset_record(3, Scenario::Problematic, Satisfaction::Neutral),
        ];
        let predictions = vec![
            PredictionRecord::Analysis(AnalysisRecord::analyzed(
                DialogId::Number(1),
                consensus(Satisfaction::Neutral),
                Vec::new(),
            )),
            PredictionRecord::Analysis(AnalysisRecord::unanalyzed(DialogId::Number(2), "timeout")),
        ];

        let output = evaluate_dataset(&dataset, &predictions, "analysis.json");
        assert_eq!(output.summary.total_dialogs, 3);
        assert_eq!(output.summary.metrics.evaluated, 1);
        assert_eq!(output.summary.unanalyzed, 2);
        assert_eq!(output.summary.metrics.satisfaction_accuracy, 1.0);

        let first = &output.per_dialog[0];
        assert_eq!(first.score_delta, Some(1));
        assert_eq!(first.false_positives, vec![MistakeType::RudeTone]);
        assert_eq!(first.false_negatives, vec![MistakeType::NoResolution]);
        assert_eq!(output.per_dialog[2].status, RecordStatus::Unanalyzed);
    }

    #[test]
    fn test_verified_correction_counts_toward_hidden_recall() {
        let dataset = vec![
            dataset_record(1, Scenario::HiddenDissatisfaction, Satisfaction::Unsatisfied),
            dataset_record(2, Scenario::HiddenDissatisfaction, Satisfaction::Unsatisfied),
        ];
        let mut corrected = consensus(Satisfaction::Unsatisfied);
        corrected.agent_mistakes.clear();
        let predictions = vec![
            PredictionRecord::Verified(VerifiedRecord {
                id: DialogId::Number(1),
                judgment: VerifiedJudgment {
                    verified: corrected,
                    checklist_results: Vec::new(),
                    changes: Vec::new(),
                    verification_status: VerificationStatus::Verified,
                    error: None,
                },
            }),
            PredictionRecord::Verified(VerifiedRecord {
                id: DialogId::Number(2),
                judgment: VerifiedJudgment::unverified(&consensus(Satisfaction::Neutral), "503"),
            }),
        ];

        let output = evaluate_dataset(&dataset, &predictions, "analysis_verified.json");
        let summary = &output.summary;
        assert_eq!(summary.metrics.hidden_dissatisfaction_total, 2);
        assert_eq!(summary.metrics.hidden_dissatisfaction_detected, 1);
        assert_eq!(summary.unverified, 1);
        assert_eq!(summary.unanalyzed, 0);

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["summary"]["hidden_dissatisfaction_recall"], 0.5);
        assert_eq!(json["summary"]["mistakes"]["no_resolution"]["fn"], 2);
    }

    #[test]
    fn test_highlights_flag_unanalyzed() {
        let summary = EvaluationSummary {
            total_dialogs: 10,
            unanalyzed: 2,
            unverified: 0,
            metrics: Metrics::default(),
        };
        let (_, weaknesses) = summary.highlights();
        assert!(weaknesses.iter().any(|w| w.contains("2 dialogs left unanalyzed")));
    }
}
