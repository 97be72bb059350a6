//! Majority aggregation of the three classification rounds
//!
//! Categorical labels take the mode of the three rounds. When all three
//! disagree the round-1 value is kept: round 1 runs under
//! `Perspective::ALL[0]`, which acts as the fallback authority. The score
//! is the median and a mistake survives when at least two rounds report it.

use crate::error::{PipelineError, Result};
use crate::types::{ConsensusJudgment, MistakeSet, MistakeType, RawJudgment, ROUNDS};

/// Minimum number of rounds that must report a mistake for it to be kept
pub const MISTAKE_MIN_AGREEMENT: usize = 2;

/// Mode of three values; all-distinct falls back to the first
pub fn mode_of_three<T: PartialEq + Copy>(values: [T; ROUNDS]) -> T {
    let [a, b, c] = values;
    if a == b || a == c {
        a
    } else if b == c {
        b
    } else {
        a
    }
}

/// Combine exactly three rounds into a consensus
pub fn aggregate(samples: &[RawJudgment; ROUNDS]) -> ConsensusJudgment {
    let intent = mode_of_three(samples.each_ref().map(|s| s.intent));
    let satisfaction = mode_of_three(samples.each_ref().map(|s| s.satisfaction));

    let mut scores = samples.each_ref().map(|s| s.quality_score);
    scores.sort();
    let quality_score = scores[ROUNDS / 2];

    let agent_mistakes: MistakeSet = MistakeType::ALL
        .into_iter()
        .filter(|m| {
            samples
                .iter()
                .filter(|s| s.agent_mistakes.contains(m))
                .count()
                >= MISTAKE_MIN_AGREEMENT
        })
        .collect();

    ConsensusJudgment {
        intent,
        satisfaction,
        quality_score,
        agent_mistakes,
    }
}

/// Fallible entry point for callers holding a slice of rounds.
///
/// Refuses to aggregate anything other than exactly three rounds: with
/// fewer, the mode and median would silently change meaning.
pub fn try_aggregate(samples: &[RawJudgment]) -> Result<ConsensusJudgment> {
    let rounds: &[RawJudgment; ROUNDS] = match samples.len() {
        n if n < ROUNDS => {
            return Err(PipelineError::IncompleteSamples {
                expected: ROUNDS,
                got: n,
            })
        }
        n if n > ROUNDS => {
            return Err(PipelineError::UnexpectedSampleCount {
                expected: ROUNDS,
                got: n,
            })
        }
        _ => samples.try_into().map_err(|_| PipelineError::UnexpectedSampleCount {
            expected: ROUNDS,
            got: samples.len(),
        })?,
    };
    Ok(aggregate(rounds))
}
