//! Checklist verification by a second model
//!
//! The verifier asks an independently configured model to run six checks
//! over a consensus judgment in one call. Each failed check may carry a
//! correction for the one field that check governs. Corrections are applied
//! as ordered patches to the immutable consensus:
//!
//! - checks are applied in checklist order, earlier items first
//! - a field patched once in a pass stays patched (earlier item wins)
//! - a correction for a field the check does not govern is dropped
//! - the quality score moves at most one point and stays within 1..=5
//!
//! If the call cannot be completed the consensus passes through unchanged
//! with status `unverified`.

use crate::classify::{extract_json, format_dialog};
use crate::error::{PipelineError, Result};
use crate::llm::{ChatModel, ChatRequest};
use crate::prompts::{build_checklist_prompt, VERIFIER_SYSTEM_PROMPT};
use crate::retry::RetryPolicy;
use crate::types::{ConsensusJudgment, Dialog, MistakeType, QualityScore, Satisfaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// The six verification checks, in priority order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItem {
    NoResolution,
    HiddenDissatisfaction,
    IgnoredQuestion,
    UnnecessaryEscalation,
    IncorrectInfo,
    QualityScoreConsistency,
}

impl ChecklistItem {
    pub const ALL: [ChecklistItem; 6] = [
        ChecklistItem::NoResolution,
        ChecklistItem::HiddenDissatisfaction,
        ChecklistItem::IgnoredQuestion,
        ChecklistItem::UnnecessaryEscalation,
        ChecklistItem::IncorrectInfo,
        ChecklistItem::QualityScoreConsistency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistItem::NoResolution => "no_resolution",
            ChecklistItem::HiddenDissatisfaction => "hidden_dissatisfaction",
            ChecklistItem::IgnoredQuestion => "ignored_question",
            ChecklistItem::UnnecessaryEscalation => "unnecessary_escalation",
            ChecklistItem::IncorrectInfo => "incorrect_info",
            ChecklistItem::QualityScoreConsistency => "quality_score_consistency",
        }
    }

    /// The only field this check may change
    pub fn governs(&self) -> Field {
        match self {
            ChecklistItem::NoResolution => Field::AgentMistake(MistakeType::NoResolution),
            ChecklistItem::HiddenDissatisfaction => Field::Satisfaction,
            ChecklistItem::IgnoredQuestion => Field::AgentMistake(MistakeType::IgnoredQuestion),
            ChecklistItem::UnnecessaryEscalation => {
                Field::AgentMistake(MistakeType::UnnecessaryEscalation)
            }
            ChecklistItem::IncorrectInfo => Field::AgentMistake(MistakeType::IncorrectInfo),
            ChecklistItem::QualityScoreConsistency => Field::QualityScore,
        }
    }
}

impl fmt::Display for ChecklistItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field of a consensus judgment that a check can patch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Membership of one mistake type in `agent_mistakes`
    AgentMistake(MistakeType),
    Satisfaction,
    QualityScore,
}

/// Corrected value proposed by the verifier for a failed check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Correction {
    Mistake { mistake_present: bool },
    Satisfaction { satisfaction: Satisfaction },
    /// Raw value; clamped when applied
    QualityScore { quality_score: i64 },
}

/// One entry of the verifier's checklist answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub item: ChecklistItem,
    pub passed: bool,
    #[serde(default)]
    pub correction: Option<Correction>,
}

/// Value of a patched field, before or after
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    Present(bool),
    Satisfaction(Satisfaction),
    Score(QualityScore),
}

/// Audit entry for one applied correction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub item: ChecklistItem,
    pub field: Field,
    pub before: FieldValue,
    pub after: FieldValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Unverified,
}

/// Consensus after the checklist pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifiedJudgment {
    pub verified: ConsensusJudgment,
    #[serde(default)]
    pub checklist_results: Vec<CheckResult>,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    pub verification_status: VerificationStatus,
    /// Why verification fell back, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifiedJudgment {
    /// Pass the consensus through untouched
    pub fn unverified(consensus: &ConsensusJudgment, reason: impl Into<String>) -> Self {
        Self {
            verified: consensus.clone(),
            checklist_results: Vec::new(),
            changes: Vec::new(),
            verification_status: VerificationStatus::Unverified,
            error: Some(reason.into()),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }
}

/// A correction waiting to be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub item: ChecklistItem,
    pub correction: Correction,
}

/// Failed checks that carry a correction, in answer order
pub fn patches_from(results: &[CheckResult]) -> Vec<Patch> {
    results
        .iter()
        .filter(|r| !r.passed)
        .filter_map(|r| {
            if r.correction.is_none() {
                tracing::debug!(item = %r.item, "check failed without correction, flagged only");
            }
            r.correction.map(|correction| Patch {
                item: r.item,
                correction,
            })
        })
        .collect()
}

fn current_value(judgment: &ConsensusJudgment, field: Field) -> FieldValue {
    match field {
        Field::AgentMistake(m) => FieldValue::Present(judgment.has_mistake(m)),
        Field::Satisfaction => FieldValue::Satisfaction(judgment.satisfaction),
        Field::QualityScore => FieldValue::Score(judgment.quality_score),
    }
}

/// Score within one point of `base` and within 1..=5
fn clamp_score(base_score: QualityScore, proposed: i64) -> QualityScore {
    let base = i64::from(base_score.get());
    let lo = (base - 1).max(i64::from(QualityScore::MIN));
    let hi = (base + 1).min(i64::from(QualityScore::MAX));
    u8::try_from(proposed.clamp(lo, hi))
        .ok()
        .and_then(QualityScore::new)
        .unwrap_or(base_score)
}

/// Apply `patches` to `base` and return the new judgment plus the audit trail.
///
/// Pure: `base` is never mutated.
pub fn apply_patches(
    base: &ConsensusJudgment,
    patches: &[Patch],
) -> (ConsensusJudgment, Vec<FieldChange>) {
    let mut ordered = patches.to_vec();
    // stable: duplicates of one item keep answer order
    ordered.sort_by_key(|p| p.item);

    let mut result = base.clone();
    let mut claimed: HashSet<Field> = HashSet::new();
    let mut changes = Vec::new();

    for patch in ordered {
        let field = patch.item.governs();
        if claimed.contains(&field) {
            tracing::debug!(item = %patch.item, "field already patched in this pass, skipping");
            continue;
        }

        let after = match (field, patch.correction) {
            (Field::AgentMistake(_), Correction::Mistake { mistake_present }) => {
                FieldValue::Present(mistake_present)
            }
            (Field::Satisfaction, Correction::Satisfaction { satisfaction }) => {
                FieldValue::Satisfaction(satisfaction)
            }
            (Field::QualityScore, Correction::QualityScore { quality_score }) => {
                FieldValue::Score(clamp_score(base.quality_score, quality_score))
            }
            (field, correction) => {
                tracing::warn!(
                    item = %patch.item,
                    ?field,
                    ?correction,
                    "correction does not match the field this check governs, dropped"
                );
                continue;
            }
        };

        claimed.insert(field);
        let before = current_value(&result, field);
        if before == after {
            continue;
        }

        match (field, after) {
            (Field::AgentMistake(m), FieldValue::Present(true)) => {
                result.agent_mistakes.insert(m);
            }
            (Field::AgentMistake(m), FieldValue::Present(false)) => {
                result.agent_mistakes.remove(&m);
            }
            (Field::Satisfaction, FieldValue::Satisfaction(s)) => result.satisfaction = s,
            (Field::QualityScore, FieldValue::Score(s)) => result.quality_score = s,
            _ => continue,
        }

        changes.push(FieldChange {
            item: patch.item,
            field,
            before,
            after,
        });
    }

    (result, changes)
}

/// Parse the verifier's `{"checks": [...]}` answer.
///
/// Every checklist item must be answered; a partial answer is malformed.
pub fn parse_checklist(content: &str) -> Result<Vec<CheckResult>> {
    #[derive(Deserialize)]
    struct Answer {
        checks: Vec<CheckResult>,
    }

    let json = extract_json(content)
        .ok_or_else(|| PipelineError::MalformedResponse("no JSON object in checklist".into()))?;
    let answer: Answer = serde_json::from_str(json)
        .map_err(|e| PipelineError::MalformedResponse(format!("checklist: {}", e)))?;

    let missing: Vec<&str> = ChecklistItem::ALL
        .iter()
        .filter(|item| !answer.checks.iter().any(|c| c.item == **item))
        .map(|item| item.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MalformedResponse(format!(
            "checklist missing items: {}",
            missing.join(", ")
        )));
    }
    Ok(answer.checks)
}

/// Run the checklist call; any failure becomes `VerificationUnavailable`
pub async fn request_checklist(
    model: &dyn ChatModel,
    retry: &RetryPolicy,
    dialog: &Dialog,
    consensus: &ConsensusJudgment,
) -> Result<Vec<CheckResult>> {
    let request = ChatRequest::new(
        VERIFIER_SYSTEM_PROMPT,
        build_checklist_prompt(&format_dialog(&dialog.turns), consensus),
    )
    .json();
    let label = format!("verify dialog={}", dialog.id);

    let content = retry
        .run(&label, model.timeout(), || model.complete(&request))
        .await
        .map_err(|e| PipelineError::VerificationUnavailable(e.to_string()))?;

    parse_checklist(&content).map_err(|e| PipelineError::VerificationUnavailable(e.to_string()))
}

/// Verify one consensus judgment. Never fails: an unavailable verifier
/// yields the unmodified consensus flagged `unverified`.
pub async fn verify(
    model: &dyn ChatModel,
    retry: &RetryPolicy,
    dialog: &Dialog,
    consensus: &ConsensusJudgment,
) -> VerifiedJudgment {
    match request_checklist(model, retry, dialog, consensus).await {
        Ok(checklist_results) => {
            let (verified, changes) = apply_patches(consensus, &patches_from(&checklist_results));
            if !changes.is_empty() {
                tracing::debug!(dialog = %dialog.id, changes = changes.len(), "verifier patched consensus");
            }
            VerifiedJudgment {
                verified,
                checklist_results,
                changes,
                verification_status: VerificationStatus::Verified,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(dialog = %dialog.id, error = %e, "verification unavailable, passing consensus through");
            VerifiedJudgment::unverified(consensus, e.to_string())
        }
    }
}
