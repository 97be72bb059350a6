//! Prompt construction
//!
//! Three analysis perspectives share one user prompt and differ only in
//! their system prompt. The checklist prompt is used by the verifier and
//! the generation prompt by the dataset generator.

use crate::types::{ConsensusJudgment, GroundTruth, Intent, Scenario};

/// System-prompt preset for one classification round.
///
/// `Perspective::ALL[0]` is round 1, which is also the tie-break authority
/// when all three rounds disagree on a categorical label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    SeniorAnalyst,
    ExperienceEvaluator,
    StrictAuditor,
}

impl Perspective {
    pub const ALL: [Perspective; 3] = [
        Perspective::SeniorAnalyst,
        Perspective::ExperienceEvaluator,
        Perspective::StrictAuditor,
    ];

    /// 1-based round number
    pub fn round(&self) -> usize {
        match self {
            Perspective::SeniorAnalyst => 1,
            Perspective::ExperienceEvaluator => 2,
            Perspective::StrictAuditor => 3,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Perspective::SeniorAnalyst => {
                "You are a senior customer support quality analyst with a decade of experience. \
                 You judge support interactions precisely and you are particularly good at \
                 spotting customers who stay polite while their problem remains unsolved."
            }
            Perspective::ExperienceEvaluator => {
                "You are a customer experience evaluator. What matters to you is whether the \
                 customer's actual problem got solved, not whether the chat ended on a friendly \
                 note. You separate genuine resolution from surface politeness."
            }
            Perspective::StrictAuditor => {
                "You are a strict quality auditor for support teams. For every interaction you \
                 check whether the core issue was resolved, which mistakes the agent made, and \
                 whether the customer is truly satisfied. You rely only on evidence in the dialog."
            }
        }
    }
}

const CALIBRATION_EXAMPLES: &str = r#"
--- Example: satisfied ---
Customer: I was billed twice for order #5531, can you look?
Agent: I see two charges of $38.00. I've refunded the duplicate; expect it in 3-5 business days.
Customer: Perfect, thanks a lot!
ANSWER:
{"intent": "payment_issue", "satisfaction": "satisfied", "quality_score": 5, "agent_mistakes": []}

--- Example: hidden dissatisfaction ---
Customer: My plan jumped from $29 to $79 and I never upgraded. Can you fix it?
Agent: Your account shows the Pro plan, so the $79 charge is correct.
Customer: I didn't authorize that. Can I get the difference back?
Agent: Charges for the current cycle are final. I've scheduled a downgrade for next month.
Customer: Okay. Thanks.
ANSWER:
{"intent": "pricing_plan", "satisfaction": "unsatisfied", "quality_score": 2, "agent_mistakes": ["incorrect_info", "no_resolution"]}

--- Example: resolved despite an open side request ---
Customer: The invoice download button does nothing for order #2210.
Agent: I've emailed you the invoice and reported the button bug to engineering.
Customer: Got it, fair enough. Thanks.
ANSWER:
{"intent": "technical_error", "satisfaction": "satisfied", "quality_score": 4, "agent_mistakes": []}

--- Example: unnecessary escalation ---
Customer: Please move me from Pro to Basic.
Agent: Let me transfer you to a billing specialist for plan changes.
Customer: Can't you just do it yourself?
Agent: Plan changes go through billing. Transferring now.
Customer: Fine...
ANSWER:
{"intent": "pricing_plan", "satisfaction": "unsatisfied", "quality_score": 2, "agent_mistakes": ["unnecessary_escalation", "no_resolution"]}
"#;

/// User prompt for one classification round
pub fn build_analysis_prompt(dialog_text: &str) -> String {
    format!(
        r#"You are assessing a customer support chat.

Calibration examples:
{examples}

Dialog to assess:
{dialog}

Rules:

INTENT (the customer's primary reason for contact, pick one):
- payment_issue: a specific payment, charge or transaction went wrong
- technical_error: the platform itself malfunctions (crash, broken feature, wrong data shown)
- account_access: login, password, lockout, 2FA, session problems
- pricing_plan: plans, pricing, upgrades/downgrades, billing cycle
- refund: wants money back or asks about a refund
- other: none of the above

SATISFACTION (the customer's real state at the end):
- satisfied: problem fully solved AND genuine gratitude
- neutral: partial resolution or lukewarm acceptance without strong emotion
- unsatisfied: problem unsolved, frustration, or polite words masking an unsolved problem

QUALITY SCORE (1-5): 5 fast and fully resolved, 4 resolved with small flaws,
3 partially resolved, 2 significant mistakes, 1 major failures.

AGENT MISTAKES (flag only with clear evidence):
- ignored_question: a direct customer question was never addressed at all
- incorrect_info: the agent stated something demonstrably false
- rude_tone: dismissive, condescending or sarcastic language
- no_resolution: the primary problem is still unsolved at the end
- unnecessary_escalation: transferred work the agent could have done

Respond exactly as:
REASONING: <two or three sentences>
ANSWER:
{{"intent": "...", "satisfaction": "...", "quality_score": N, "agent_mistakes": [...]}}"#,
        examples = CALIBRATION_EXAMPLES.trim(),
        dialog = dialog_text,
    )
}

pub const VERIFIER_SYSTEM_PROMPT: &str = "You are a precise quality auditor reviewing another \
     analyst's assessment of a support chat. Perform every check, then answer with JSON only.";

/// Checklist prompt for the verification model
pub fn build_checklist_prompt(dialog_text: &str, consensus: &ConsensusJudgment) -> String {
    let initial = serde_json::to_string(consensus).unwrap_or_default();
    format!(
        r#"Verify the initial assessment of this support dialog.

DIALOG:
{dialog}

INITIAL ASSESSMENT:
{initial}

Run each check. "passed": true means the initial assessment is right for that check.
When a check fails, give the corrected value in "correction".

1. no_resolution: Did the agent take a concrete action (refund issued, account unlocked,
   working steps the customer accepted)? Decide whether no_resolution belongs in the mistakes.
   correction: {{"mistake_present": true|false}}
2. hidden_dissatisfaction: Strip polite words from the customer's last messages. Is the
   original problem actually solved? If not, satisfaction must be "unsatisfied".
   correction: {{"satisfaction": "satisfied"|"neutral"|"unsatisfied"}}
3. ignored_question: List every direct customer question. Was each one addressed at least
   partially? correction: {{"mistake_present": true|false}}
4. unnecessary_escalation: Was the customer redirected for something the agent could have
   handled? Genuine engineering, legal or compliance escalations do not count.
   correction: {{"mistake_present": true|false}}
5. incorrect_info: Did the agent state something contradicted by facts in the dialog?
   Vague answers do not count. correction: {{"mistake_present": true|false}}
6. quality_score_consistency: Is the score consistent with the mistakes and the outcome?
   satisfied with no mistakes fits 4-5, unsatisfied with two or more mistakes fits 1-2,
   neutral fits 2-4. correction: {{"quality_score": N}}

Return ONLY:
{{"checks": [{{"item": "no_resolution", "passed": true, "correction": null}}, ...]}}
with one entry for each of the six items, in order."#,
        dialog = dialog_text,
        initial = initial,
    )
}

pub const GENERATOR_SYSTEM_PROMPT: &str =
    "You generate datasets. Output only valid JSON, no extra text.";

fn intent_description(intent: Intent) -> &'static str {
    match intent {
        Intent::PaymentIssue => {
            "A specific payment transaction went wrong: failed or double charge, wrong amount, \
             pending payment, card declined at checkout."
        }
        Intent::TechnicalError => {
            "A software bug or platform malfunction, not a payment failure: crashes, pages not \
             loading, broken buttons, wrong dashboard data, failing exports."
        }
        Intent::AccountAccess => {
            "Cannot log in, forgotten password, locked account, 2FA or email verification \
             problems, sessions expiring."
        }
        Intent::PricingPlan => {
            "Questions about plans, pricing tiers, feature comparison, upgrades, downgrades or \
             billing cycle changes."
        }
        Intent::Refund => {
            "Wants money back for a completed transaction: refund request, refund status, \
             partial refund, refund policy."
        }
        Intent::Other => "Anything that does not fit the other categories.",
    }
}

fn scenario_description(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Successful => "The agent resolves the issue smoothly and professionally.",
        Scenario::Problematic => {
            "The agent struggles: communication problems or only partial resolution."
        }
        Scenario::Conflict => "The conversation turns tense; the customer is clearly frustrated.",
        Scenario::AgentError => "The agent makes significant errors.",
        Scenario::HiddenDissatisfaction => {
            "The customer stays polite but the issue is not actually resolved."
        }
    }
}

/// Prompt asking the generator model for one dialog matching `truth`
pub fn build_generation_prompt(truth: &GroundTruth) -> String {
    let mistakes = if truth.agent_mistakes.is_empty() {
        "none".to_string()
    } else {
        truth
            .agent_mistakes
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let hidden_note = if truth.scenario == Scenario::HiddenDissatisfaction {
        "\nThe customer must thank the agent and sound polite at the end while the real \
         problem stays unresolved. They do not complain openly; keep it subtle.\n"
    } else {
        ""
    };

    format!(
        r#"Write a realistic customer support chat for an online payments platform.

Parameters:
- Intent: {intent} ({intent_desc})
- Case type: {scenario} ({scenario_desc})
- Target satisfaction: {satisfaction}
- Agent quality score: {score}/5
- Agent mistakes to show: {mistakes}
{hidden}
Rules:
- 8 to 16 messages alternating between customer and agent
- natural wording, varied customer tone, professional agent style
- concrete details such as order numbers, error codes, dates
- the listed mistakes must be clearly visible; no others
- stay on the given intent
- no labels or annotations inside the dialog

Return ONLY:
{{"messages": [{{"role": "customer", "text": "..."}}, {{"role": "agent", "text": "..."}}]}}"#,
        intent = truth.intent,
        intent_desc = intent_description(truth.intent),
        scenario = truth.scenario,
        scenario_desc = scenario_description(truth.scenario),
        satisfaction = truth.satisfaction,
        score = truth.quality_score,
        mistakes = mistakes,
        hidden = hidden_note,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MistakeType, QualityScore, Satisfaction};

    #[test]
    fn test_perspectives_are_distinct() {
        let prompts: std::collections::HashSet<_> =
            Perspective::ALL.iter().map(|p| p.system_prompt()).collect();
        assert_eq!(prompts.len(), 3);
        assert_eq!(Perspective::ALL[0].round(), 1);
    }

    #[test]
    fn test_analysis_prompt_contains_dialog() {
        let prompt = build_analysis_prompt("Customer: hello\nAgent: hi");
        assert!(prompt.contains("Customer: hello"));
        assert!(prompt.contains("ANSWER:"));
    }

    #[test]
    fn test_generation_prompt_mentions_hidden_dissatisfaction() {
        let truth = GroundTruth {
            intent: Intent::Refund,
            satisfaction: Satisfaction::Unsatisfied,
            quality_score: QualityScore::new(2).unwrap(),
            scenario: Scenario::HiddenDissatisfaction,
            agent_mistakes: [MistakeType::NoResolution].into_iter().collect(),
        };
        let prompt = build_generation_prompt(&truth);
        assert!(prompt.contains("no_resolution"));
        assert!(prompt.contains("sound polite"));
        assert!(prompt.contains("refund"));
    }
}
