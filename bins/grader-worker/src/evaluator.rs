/// Score Evaluator - Deterministic Grading Formula
///
/// **Critical Properties:**
/// - Knows nothing about Docker, archives or report formats
/// - Pure function: (visible, hidden, violations, hidden configured) → score
///
/// **Scoring Rules:**
/// - Style: 20 points, minus 2 per violation, floored at 0
/// - Hidden tests configured: visible up to 40, hidden up to 40
/// - No hidden tests configured: visible up to 80
/// - An empty outcome list earns 0, never full credit; a build that
///   never reached its tests must not score as if every test passed
///
/// **Pass Gate:**
/// score ≥ 60 AND sandbox exit code 0. The exit code is an independent
/// gate and is not folded into the score.

use grader_common::{StyleViolation, TestOutcome};
use serde::Serialize;

pub const PASS_THRESHOLD: u32 = 60;
const STYLE_MAX: u32 = 20;
const STYLE_PENALTY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub visible: u32,
    pub hidden: u32,
    pub style: u32,
    pub total: u32,
}

/// Points earned for a proportional pass rate, rounded half up
fn proportional_score(outcomes: &[TestOutcome], max_points: u32) -> u32 {
    if outcomes.is_empty() {
        return 0;
    }
    let passed = outcomes.iter().filter(|o| o.passed).count() as f64;
    (passed / outcomes.len() as f64 * max_points as f64).round() as u32
}

pub fn style_score(violation_count: usize) -> u32 {
    let penalty = (violation_count as u64).saturating_mul(STYLE_PENALTY as u64);
    (STYLE_MAX as u64).saturating_sub(penalty) as u32
}

/// Compute the score breakdown for one grading run
pub fn score(
    visible: &[TestOutcome],
    hidden: &[TestOutcome],
    violations: &[StyleViolation],
    hidden_configured: bool,
) -> ScoreBreakdown {
    let style = style_score(violations.len());

    let (visible, hidden) = if hidden_configured {
        (proportional_score(visible, 40), proportional_score(hidden, 40))
    } else {
        (proportional_score(visible, 80), 0)
    };

    ScoreBreakdown {
        visible,
        hidden,
        style,
        total: visible + hidden + style,
    }
}

pub fn is_passing(score: u32, exit_code: i64) -> bool {
    score >= PASS_THRESHOLD && exit_code == 0
}
