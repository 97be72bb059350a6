//! Synthetic dataset generation
//!
//! The dataset is a fixed matrix: every generated intent crossed with
//! twenty scenario templates. Ground truth comes from the template, the
//! transcript from the generator model.

use crate::classify::extract_json;
use crate::error::{PipelineError, Result};
use crate::llm::{ChatModel, ChatRequest};
use crate::prompts::{build_generation_prompt, GENERATOR_SYSTEM_PROMPT};
use crate::records::DatasetRecord;
use crate::retry::RetryPolicy;
use crate::types::{
    DialogId, GroundTruth, Intent, MistakeType, QualityScore, Satisfaction, Scenario, Turn,
};
use crate::types::MistakeType::{
    IgnoredQuestion, IncorrectInfo, NoResolution, RudeTone, UnnecessaryEscalation,
};
use crate::types::Satisfaction::{Neutral, Satisfied, Unsatisfied};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Intents the generator writes dialogs for (`other` is never generated)
pub const GENERATED_INTENTS: [Intent; 5] = [
    Intent::PaymentIssue,
    Intent::TechnicalError,
    Intent::AccountAccess,
    Intent::PricingPlan,
    Intent::Refund,
];

/// Ground-truth shape shared by every intent
#[derive(Debug, Clone, Copy)]
pub struct ScenarioTemplate {
    pub scenario: Scenario,
    pub satisfaction: Satisfaction,
    pub quality_score: u8,
    pub agent_mistakes: &'static [MistakeType],
}

const fn template(
    scenario: Scenario,
    satisfaction: Satisfaction,
    quality_score: u8,
    agent_mistakes: &'static [MistakeType],
) -> ScenarioTemplate {
    ScenarioTemplate {
        scenario,
        satisfaction,
        quality_score,
        agent_mistakes,
    }
}

pub const SCENARIO_TEMPLATES: [ScenarioTemplate; 20] = [
    template(Scenario::Successful, Satisfied, 5, &[]),
    template(Scenario::Successful, Satisfied, 4, &[]),
    template(Scenario::Successful, Neutral, 3, &[]),
    template(Scenario::Successful, Satisfied, 4, &[]),
    template(Scenario::Problematic, Neutral, 3, &[IgnoredQuestion]),
    template(Scenario::Problematic, Unsatisfied, 2, &[NoResolution]),
    template(Scenario::Problematic, Neutral, 3, &[IncorrectInfo]),
    template(Scenario::Conflict, Unsatisfied, 2, &[RudeTone, NoResolution]),
    template(Scenario::Conflict, Unsatisfied, 1, &[IgnoredQuestion, RudeTone]),
    template(Scenario::Conflict, Unsatisfied, 2, &[UnnecessaryEscalation]),
    template(Scenario::Conflict, Unsatisfied, 1, &[IncorrectInfo, NoResolution]),
    template(Scenario::AgentError, Unsatisfied, 1, &[IncorrectInfo, IgnoredQuestion, NoResolution]),
    template(Scenario::AgentError, Unsatisfied, 2, &[RudeTone, IncorrectInfo]),
    template(Scenario::AgentError, Unsatisfied, 1, &[NoResolution, UnnecessaryEscalation]),
    template(Scenario::HiddenDissatisfaction, Unsatisfied, 2, &[NoResolution]),
    template(Scenario::HiddenDissatisfaction, Unsatisfied, 3, &[IgnoredQuestion]),
    template(Scenario::HiddenDissatisfaction, Unsatisfied, 2, &[IncorrectInfo]),
    template(Scenario::Successful, Satisfied, 5, &[]),
    template(Scenario::Problematic, Neutral, 3, &[UnnecessaryEscalation]),
    template(Scenario::Problematic, Unsatisfied, 2, &[IgnoredQuestion, NoResolution]),
];

/// One planned dialog: id plus the labels it must exhibit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDialog {
    pub id: DialogId,
    pub ground_truth: GroundTruth,
}

/// Intents x templates, ids numbered from 1
pub fn build_scenario_matrix() -> Vec<PlannedDialog> {
    GENERATED_INTENTS
        .iter()
        .flat_map(|&intent| SCENARIO_TEMPLATES.iter().map(move |t| (intent, t)))
        .filter_map(|(intent, t)| {
            Some(GroundTruth {
                intent,
                satisfaction: t.satisfaction,
                quality_score: QualityScore::new(t.quality_score)?,
                scenario: t.scenario,
                agent_mistakes: t.agent_mistakes.iter().copied().collect(),
            })
        })
        .zip(1u64..)
        .map(|(ground_truth, id)| PlannedDialog {
            id: DialogId::Number(id),
            ground_truth,
        })
        .collect()
}

/// Parse the generator's `{"messages": [...]}` answer
pub fn parse_generated_dialog(content: &str) -> Result<Vec<Turn>> {
    #[derive(Deserialize)]
    struct Answer {
        messages: Vec<Turn>,
    }

    let json = extract_json(content)
        .ok_or_else(|| PipelineError::MalformedResponse("no JSON object in dialog".into()))?;
    let answer: Answer = serde_json::from_str(json)
        .map_err(|e| PipelineError::MalformedResponse(format!("dialog: {}", e)))?;
    if answer.messages.is_empty() {
        return Err(PipelineError::MalformedResponse("dialog has no messages".into()));
    }
    Ok(answer.messages)
}

/// Ask the generator model for one transcript
pub async fn generate_dialog(
    model: &dyn ChatModel,
    retry: &RetryPolicy,
    planned: &PlannedDialog,
) -> Result<DatasetRecord> {
    let request = ChatRequest::new(
        GENERATOR_SYSTEM_PROMPT,
        build_generation_prompt(&planned.ground_truth),
    )
    .json();
    let label = format!("generate dialog={}", planned.id);

    let content = retry
        .run(&label, model.timeout(), || model.complete(&request))
        .await?;

    Ok(DatasetRecord {
        id: planned.id.clone(),
        dialog: parse_generated_dialog(&content)?,
        ground_truth: planned.ground_truth.clone(),
    })
}

/// Label counts for a generated dataset
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub by_intent: BTreeMap<Intent, usize>,
    pub by_scenario: BTreeMap<Scenario, usize>,
    pub by_satisfaction: BTreeMap<Satisfaction, usize>,
    pub hidden_dissatisfaction: usize,
}

impl Distribution {
    pub fn of(records: &[DatasetRecord]) -> Self {
        let mut dist = Self::default();
        for record in records {
            let truth = &record.ground_truth;
            *dist.by_intent.entry(truth.intent).or_insert(0) += 1;
            *dist.by_scenario.entry(truth.scenario).or_insert(0) += 1;
            *dist.by_satisfaction.entry(truth.satisfaction).or_insert(0) += 1;
            if truth.scenario == Scenario::HiddenDissatisfaction {
                dist.hidden_dissatisfaction += 1;
            }
        }
        dist
    }

    pub fn print(&self) {
        println!("\n  Intents:");
        for (intent, count) in &self.by_intent {
            println!("    {:<24} {}", intent.as_str(), count);
        }
        println!("  Case types:");
        for (scenario, count) in &self.by_scenario {
            println!("    {:<24} {}", scenario.as_str(), count);
        }
        println!("  Satisfaction:");
        for (satisfaction, count) in &self.by_satisfaction {
            println!("    {:<24} {}", satisfaction.as_str(), count);
        }
        println!("  Hidden dissatisfaction: {}", self.hidden_dissatisfaction);
    }
}
