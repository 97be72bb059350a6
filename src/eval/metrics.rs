//! Accuracy metrics against ground truth
//!
//! Pure functions over `(GroundTruth, ConsensusJudgment)` pairs. Every
//! ratio with an empty denominator is reported as 0.0.

use crate::types::{ConsensusJudgment, GroundTruth, MistakeType, Satisfaction, Scenario};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// Binary-classifier counts and scores for one mistake type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MistakeMetrics {
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl MistakeMetrics {
    fn from_counts(tp: usize, fp: usize, fn_: usize) -> Self {
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            tp,
            fp,
            fn_,
            precision,
            recall,
            f1,
        }
    }
}

/// Summary metrics over judged dialogs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub evaluated: usize,
    pub intent_accuracy: f64,
    pub satisfaction_accuracy: f64,
    pub quality_mae: f64,
    pub quality_exact_match: f64,
    pub quality_within_one: f64,
    pub quality_correlation: f64,
    /// Share of hidden-dissatisfaction dialogs predicted `unsatisfied`
    pub hidden_dissatisfaction_recall: f64,
    pub hidden_dissatisfaction_total: usize,
    pub hidden_dissatisfaction_detected: usize,
    pub mistakes: BTreeMap<MistakeType, MistakeMetrics>,
    pub mistakes_avg_f1: f64,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Pearson correlation; 0.0 with fewer than two points or zero variance
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 || xs.len() != ys.len() {
        return 0.0;
    }
    let sx = xs.iter().std_dev();
    let sy = ys.iter().std_dev();
    if sx == 0.0 || sy == 0.0 || sx.is_nan() || sy.is_nan() {
        return 0.0;
    }
    xs.iter().covariance(ys.iter()) / (sx * sy)
}

/// Per-type confusion counts for the mistake taxonomy
pub fn mistake_metrics(records: &[(GroundTruth, ConsensusJudgment)]) -> BTreeMap<MistakeType, MistakeMetrics> {
    MistakeType::ALL
        .into_iter()
        .map(|mistake| {
            let (mut tp, mut fp, mut fn_) = (0, 0, 0);
            for (truth, predicted) in records {
                match (truth.agent_mistakes.contains(&mistake), predicted.has_mistake(mistake)) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_ += 1,
                    (false, false) => {}
                }
            }
            (mistake, MistakeMetrics::from_counts(tp, fp, fn_))
        })
        .collect()
}

/// Compute all summary metrics
pub fn evaluate(records: &[(GroundTruth, ConsensusJudgment)]) -> Metrics {
    let n = records.len();

    let intent_correct = records.iter().filter(|(t, p)| t.intent == p.intent).count();
    let satisfaction_correct = records
        .iter()
        .filter(|(t, p)| t.satisfaction == p.satisfaction)
        .count();

    let diffs: Vec<u8> = records
        .iter()
        .map(|(t, p)| t.quality_score.abs_diff(p.quality_score))
        .collect();
    let total_diff: usize = diffs.iter().map(|&d| usize::from(d)).sum();

    let truth_scores: Vec<f64> = records.iter().map(|(t, _)| f64::from(t.quality_score.get())).collect();
    let predicted_scores: Vec<f64> = records.iter().map(|(_, p)| f64::from(p.quality_score.get())).collect();

    let hidden: Vec<&ConsensusJudgment> = records
        .iter()
        .filter(|(t, _)| t.scenario == Scenario::HiddenDissatisfaction)
        .map(|(_, p)| p)
        .collect();
    let hidden_detected = hidden
        .iter()
        .filter(|p| p.satisfaction == Satisfaction::Unsatisfied)
        .count();

    let mistakes = mistake_metrics(records);
    let mistakes_avg_f1 = mistakes.values().map(|m| m.f1).sum::<f64>() / MistakeType::ALL.len() as f64;

    Metrics {
        evaluated: n,
        intent_accuracy: ratio(intent_correct, n),
        satisfaction_accuracy: ratio(satisfaction_correct, n),
        quality_mae: ratio(total_diff, n),
        quality_exact_match: ratio(diffs.iter().filter(|&&d| d == 0).count(), n),
        quality_within_one: ratio(diffs.iter().filter(|&&d| d <= 1).count(), n),
        quality_correlation: pearson(&truth_scores, &predicted_scores),
        hidden_dissatisfaction_recall: ratio(hidden_detected, hidden.len()),
        hidden_dissatisfaction_total: hidden.len(),
        hidden_dissatisfaction_detected: hidden_detected,
        mistakes,
        mistakes_avg_f1,
    }
}
