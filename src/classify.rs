//! Single-round classification
//!
//! `classify` sends one dialog to the primary model under one perspective
//! and parses the answer strictly: an unknown label or an out-of-range
//! score fails the round instead of being patched to a default.

use crate::error::{PipelineError, Result};
use crate::llm::{ChatModel, ChatRequest};
use crate::prompts::{build_analysis_prompt, Perspective};
use crate::retry::RetryPolicy;
use crate::types::{Dialog, Intent, MistakeSet, QualityScore, RawJudgment, Satisfaction, Turn};
use serde::Deserialize;

/// Render turns as `Speaker: text` lines
pub fn format_dialog(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.speaker.label(), t.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Locate the JSON object in a model answer.
///
/// Prefers the object after an `ANSWER:` marker, ignores markdown code
/// fences, and otherwise takes the first balanced object in the text.
pub fn extract_json(content: &str) -> Option<&str> {
    let search_from = content.find("ANSWER:").map(|i| i + "ANSWER:".len()).unwrap_or(0);
    let start = search_from + content[search_from..].find('{')?;
    balanced_object(&content[start..])
}

/// Slice of `text` (starting at `{`) up to its matching `}`
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Text between `REASONING:` and `ANSWER:`, if present
fn extract_rationale(content: &str) -> String {
    let Some(start) = content.find("REASONING:") else {
        return String::new();
    };
    let rest = &content[start + "REASONING:".len()..];
    let end = rest.find("ANSWER:").unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

/// Parse one round's answer into a `RawJudgment`
pub fn parse_raw_judgment(content: &str) -> Result<RawJudgment> {
    #[derive(Deserialize)]
    struct Answer {
        intent: Intent,
        satisfaction: Satisfaction,
        quality_score: QualityScore,
        #[serde(default)]
        agent_mistakes: MistakeSet,
    }

    let json = extract_json(content)
        .ok_or_else(|| PipelineError::MalformedResponse("no JSON object in answer".into()))?;
    let answer: Answer = serde_json::from_str(json)
        .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;

    Ok(RawJudgment {
        intent: answer.intent,
        satisfaction: answer.satisfaction,
        quality_score: answer.quality_score,
        agent_mistakes: answer.agent_mistakes,
        rationale: extract_rationale(content),
    })
}

/// Classify one dialog under one perspective.
///
/// Transient call failures are retried by `retry`; a malformed answer is
/// returned as an error immediately.
pub async fn classify(
    model: &dyn ChatModel,
    retry: &RetryPolicy,
    dialog: &Dialog,
    perspective: Perspective,
) -> Result<RawJudgment> {
    let request = ChatRequest::new(
        perspective.system_prompt(),
        build_analysis_prompt(&format_dialog(&dialog.turns)),
    );
    let label = format!("classify dialog={} round={}", dialog.id, perspective.round());

    let content = retry
        .run(&label, model.timeout(), || model.complete(&request))
        .await?;

    parse_raw_judgment(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::FnModel;
    use crate::types::{DialogId, MistakeType, Speaker};

    #[test]
    fn test_reasoning_and_answer() {
        let content = "REASONING: The customer got a refund and was happy.\nANSWER:\n\
            {\"intent\": \"payment_issue\", \"satisfaction\": \"satisfied\", \"quality_score\": 5, \"agent_mistakes\": []}";
        let judgment = parse_raw_judgment(content).unwrap();
        assert_eq!(judgment.intent, Intent::PaymentIssue);
        assert_eq!(judgment.quality_score.get(), 5);
        assert_eq!(judgment.rationale, "The customer got a refund and was happy.");
    }

    #[test]
    fn test_code_fenced_answer() {
        let content = "```json\n{\"intent\": \"refund\", \"satisfaction\": \"neutral\", \"quality_score\": 3, \"agent_mistakes\": [\"no_resolution\"]}\n```";
        let judgment = parse_raw_judgment(content).unwrap();
        assert_eq!(judgment.intent, Intent::Refund);
        assert!(judgment.agent_mistakes.contains(&MistakeType::NoResolution));
    }

    #[test]
    fn test_braces_inside_reasoning_are_skipped() {
        let content = "REASONING: agent used template {name}.\nANSWER: {\"intent\": \"other\", \"satisfaction\": \"neutral\", \"quality_score\": 3}";
        let judgment = parse_raw_judgment(content).unwrap();
        assert_eq!(judgment.intent, Intent::Other);
        assert!(judgment.agent_mistakes.is_empty());
    }

    #[test]
    fn test_invalid_labels_are_rejected() {
        for bad in [
            r#"{"intent": "banana", "satisfaction": "neutral", "quality_score": 3, "agent_mistakes": []}"#,
            r#"{"intent": "refund", "satisfaction": "very_happy", "quality_score": 3, "agent_mistakes": []}"#,
            r#"{"intent": "refund", "satisfaction": "neutral", "quality_score": 10, "agent_mistakes": []}"#,
            r#"{"intent": "refund", "satisfaction": "neutral", "quality_score": "high", "agent_mistakes": []}"#,
            r#"{"intent": "refund", "satisfaction": "neutral", "quality_score": 3, "agent_mistakes": ["fake"]}"#,
            "I could not decide.",
        ] {
            assert!(
                matches!(parse_raw_judgment(bad), Err(PipelineError::MalformedResponse(_))),
                "accepted: {}",
                bad
            );
        }
    }

    #[test]
    fn test_format_dialog() {
        let turns = vec![
            Turn { speaker: Speaker::Customer, text: "Hello".into() },
            Turn { speaker: Speaker::Agent, text: "Hi there".into() },
        ];
        assert_eq!(format_dialog(&turns), "Customer: Hello\nAgent: Hi there");
    }

    #[tokio::test]
    async fn test_classify_uses_perspective_system_prompt() {
        let model = FnModel::new("primary", |request: &ChatRequest| {
            assert_eq!(request.system, Perspective::StrictAuditor.system_prompt());
            Ok(r#"ANSWER: {"intent": "account_access", "satisfaction": "unsatisfied", "quality_score": 1, "agent_mistakes": ["ignored_question"]}"#.to_string())
        });
        let dialog = Dialog {
            id: DialogId::Number(7),
            turns: vec![Turn { speaker: Speaker::Customer, text: "Locked out?".into() }],
        };

        let judgment = classify(&model, &RetryPolicy::no_retry(), &dialog, Perspective::StrictAuditor)
            .await
            .unwrap();
        assert_eq!(judgment.intent, Intent::AccountAccess);
    }
}
