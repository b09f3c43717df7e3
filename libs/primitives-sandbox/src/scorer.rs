/// Scorer - pure function from test outcome and effort to score, XP and feedback
///
/// **Score:**
/// - 0 outright when there are no cases, no bonus or penalty applies
/// - base = passed * 100 / total
/// - minus min(hints * 10, 30)
/// - plus 10 if finished in under half the expected time
/// - plus 5 if every case passed without hints
/// - clamped to [0, 100]
///
/// **XP:**
/// 10, plus 40 if no case failed (an empty case list counts), plus 5 per
/// full 10 points of score, plus 25 for a score of 100.
use primitives_common::types::ScoreBreakdown;

pub const FEEDBACK_PERFECT: &str = "🎉 Perfect score! Excellent work!";
pub const FEEDBACK_ALL_PASSED: &str = "✅ All tests passed! Great job!";
pub const FEEDBACK_SOME_PASSED: &str = "Almost there! Some tests need attention.";
pub const FEEDBACK_NONE_PASSED: &str = "Keep trying! Check your logic.";

const HINT_PENALTY: i64 = 10;
const MAX_HINT_PENALTY: i64 = 30;
const SPEED_BONUS: i64 = 10;
const PERFECT_BONUS: i64 = 5;

pub fn score(
    passed: u32,
    total: u32,
    hints_used: u32,
    time_spent_seconds: u32,
    expected_minutes: u32,
) -> ScoreBreakdown {
    let passed = passed.min(total);
    let all_passed = passed == total;

    let score = if total == 0 {
        0
    } else {
        let base = i64::from(passed) * 100 / i64::from(total);

        let hint_penalty = (i64::from(hints_used) * HINT_PENALTY).min(MAX_HINT_PENALTY);

        // time < expected/2, kept in integers
        let speed_bonus = if u64::from(time_spent_seconds) * 2 < u64::from(expected_minutes) * 60 {
            SPEED_BONUS
        } else {
            0
        };

        let perfect_bonus = if all_passed && hints_used == 0 {
            PERFECT_BONUS
        } else {
            0
        };

        (base - hint_penalty + speed_bonus + perfect_bonus).clamp(0, 100) as u32
    };

    let mut xp_earned = 10;
    if all_passed {
        xp_earned += 40;
    }
    xp_earned += (score / 10) * 5;
    if score == 100 {
        xp_earned += 25;
    }

    ScoreBreakdown {
        score,
        xp_earned,
        passed: all_passed,
        feedback: feedback(passed, total, score).to_string(),
    }
}

/// Fixed feedback for the outcome.
pub fn feedback(passed: u32, total: u32, score: u32) -> &'static str {
    if passed >= total {
        if score == 100 {
            FEEDBACK_PERFECT
        } else {
            FEEDBACK_ALL_PASSED
        }
    } else if passed > 0 {
        FEEDBACK_SOME_PASSED
    } else {
        FEEDBACK_NONE_PASSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_run_with_speed_bonus() {
        let result = score(5, 5, 0, 30, 5);
        assert_eq!(result.score, 100);
        assert_eq!(result.xp_earned, 125);
        assert!(result.passed);
        assert_eq!(result.feedback, FEEDBACK_PERFECT);
    }

    #[test]
    fn test_partial_run_with_hints() {
        let result = score(3, 5, 2, 400, 5);
        assert_eq!(result.score, 40);
        assert_eq!(result.xp_earned, 30);
        assert!(!result.passed);
        assert_eq!(result.feedback, FEEDBACK_SOME_PASSED);
    }

    #[test]
    fn test_no_cases_scores_zero() {
        // fast finish would earn the speed bonus if any case existed
        let result = score(0, 0, 0, 30, 5);
        assert_eq!(result.score, 0);
        assert!(result.passed);
        assert_eq!(result.xp_earned, 50);
        assert_eq!(result.feedback, FEEDBACK_ALL_PASSED);

        let result = score(0, 0, 3, 30, 5);
        assert_eq!(result.score, 0);
        assert_eq!(result.xp_earned, 50);
    }

    #[test]
    fn test_hint_penalty_caps_at_thirty() {
        // base 100, perfect bonus lost, no speed bonus
        assert_eq!(score(4, 4, 3, 1000, 5).score, 70);
        assert_eq!(score(4, 4, 10, 1000, 5).score, 70);
    }

    #[test]
    fn test_score_never_negative() {
        let result = score(0, 5, 10, 1000, 5);
        assert_eq!(result.score, 0);
        assert_eq!(result.xp_earned, 10);
    }

    #[test]
    fn test_all_passed_with_hints_is_not_perfect() {
        let result = score(2, 2, 1, 1000, 5);
        assert_eq!(result.score, 90);
        assert!(result.passed);
        assert_eq!(result.feedback, FEEDBACK_ALL_PASSED);
        assert_eq!(result.xp_earned, 10 + 40 + 45);
    }

    #[test]
    fn test_speed_bonus_boundary() {
        // exactly half the expected time earns nothing
        assert_eq!(score(1, 2, 0, 150, 5).score, 50);
        assert_eq!(score(1, 2, 0, 149, 5).score, 60);
        assert_eq!(score(1, 2, 0, 0, 0).score, 50);
    }

    #[test]
    fn test_base_truncates() {
        // 2/3 = 66.6 -> 66
        assert_eq!(score(2, 3, 0, 1000, 5).score, 66);
    }

    #[test]
    fn test_passed_is_clamped_to_total() {
        let result = score(9, 3, 0, 1000, 5);
        assert_eq!(result.score, 100);
        assert!(result.passed);
    }

    #[test]
    fn test_feedback_table() {
        assert_eq!(feedback(3, 3, 100), FEEDBACK_PERFECT);
        assert_eq!(feedback(3, 3, 80), FEEDBACK_ALL_PASSED);
        assert_eq!(feedback(1, 3, 33), FEEDBACK_SOME_PASSED);
        assert_eq!(feedback(0, 3, 0), FEEDBACK_NONE_PASSED);
        assert_eq!(feedback(0, 0, 0), FEEDBACK_ALL_PASSED);
    }
}
