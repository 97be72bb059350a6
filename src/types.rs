//! Core types for the support-qa pipeline
//!
//! Everything that flows between stages lives here:
//! - Dialogs and their ground truth (produced once by the generator)
//! - Raw judgments (one per round, kept for audit only)
//! - Consensus judgments (majority of three rounds)
//!
//! Labels are closed enums so a stray model label can never reach the
//! aggregator; parsing rejects it instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Number of independent classification rounds per dialog.
pub const ROUNDS: usize = 3;

/// Stable dialog identifier (integer or string)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DialogId {
    Number(u64),
    Text(String),
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogId::Number(n) => write!(f, "{}", n),
            DialogId::Text(s) => f.write_str(s),
        }
    }
}

/// Who wrote a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Customer,
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Customer => "Customer",
            Speaker::Agent => "Agent",
        }
    }
}

/// One message in a transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    #[serde(alias = "role")]
    pub speaker: Speaker,
    pub text: String,
}

/// An ordered, immutable support transcript
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dialog {
    pub id: DialogId,
    pub turns: Vec<Turn>,
}

/// Primary reason the customer contacted support
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PaymentIssue,
    TechnicalError,
    AccountAccess,
    PricingPlan,
    Refund,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::PaymentIssue => "payment_issue",
            Intent::TechnicalError => "technical_error",
            Intent::AccountAccess => "account_access",
            Intent::PricingPlan => "pricing_plan",
            Intent::Refund => "refund",
            Intent::Other => "other",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer's real satisfaction at the end of the dialog
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Satisfaction {
    Satisfied,
    Neutral,
    Unsatisfied,
}

impl Satisfaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Satisfaction::Satisfied => "satisfied",
            Satisfaction::Neutral => "neutral",
            Satisfaction::Unsatisfied => "unsatisfied",
        }
    }
}

impl fmt::Display for Satisfaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed agent-mistake taxonomy.
///
/// Variant order is the canonical order used in reports and in
/// serialized mistake sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MistakeType {
    IgnoredQuestion,
    IncorrectInfo,
    RudeTone,
    NoResolution,
    UnnecessaryEscalation,
}

impl MistakeType {
    pub const ALL: [MistakeType; 5] = [
        MistakeType::IgnoredQuestion,
        MistakeType::IncorrectInfo,
        MistakeType::RudeTone,
        MistakeType::NoResolution,
        MistakeType::UnnecessaryEscalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MistakeType::IgnoredQuestion => "ignored_question",
            MistakeType::IncorrectInfo => "incorrect_info",
            MistakeType::RudeTone => "rude_tone",
            MistakeType::NoResolution => "no_resolution",
            MistakeType::UnnecessaryEscalation => "unnecessary_escalation",
        }
    }
}

impl fmt::Display for MistakeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of mistakes, always iterated in taxonomy order
pub type MistakeSet = BTreeSet<MistakeType>;

/// Scenario tag used to stratify the dataset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Successful,
    Problematic,
    Conflict,
    AgentError,
    HiddenDissatisfaction,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Successful => "successful",
            Scenario::Problematic => "problematic",
            Scenario::Conflict => "conflict",
            Scenario::AgentError => "agent_error",
            Scenario::HiddenDissatisfaction => "hidden_dissatisfaction",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent quality score, always within 1..=5
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "i64", into = "u8")]
pub struct QualityScore(u8);

impl QualityScore {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Returns `None` when the value is outside 1..=5
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Distance between two scores
    pub fn abs_diff(self, other: QualityScore) -> u8 {
        self.0.abs_diff(other.0)
    }
}

impl TryFrom<i64> for QualityScore {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(QualityScore::new)
            .ok_or_else(|| format!("quality_score {} outside 1..=5", value))
    }
}

impl From<QualityScore> for u8 {
    fn from(score: QualityScore) -> u8 {
        score.0
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expert labels for a dialog. Never shown to the classifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroundTruth {
    pub intent: Intent,
    pub satisfaction: Satisfaction,
    pub quality_score: QualityScore,
    pub scenario: Scenario,
    #[serde(default)]
    pub agent_mistakes: MistakeSet,
}

/// One round's classification output for one dialog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawJudgment {
    pub intent: Intent,
    pub satisfaction: Satisfaction,
    pub quality_score: QualityScore,
    #[serde(default)]
    pub agent_mistakes: MistakeSet,
    /// Free-text reasoning; never used by aggregation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rationale: String,
}

/// Majority view of the three rounds for one dialog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusJudgment {
    pub intent: Intent,
    pub satisfaction: Satisfaction,
    pub quality_score: QualityScore,
    #[serde(default)]
    pub agent_mistakes: MistakeSet,
}

impl ConsensusJudgment {
    pub fn has_mistake(&self, mistake: MistakeType) -> bool {
        self.agent_mistakes.contains(&mistake)
    }
}
