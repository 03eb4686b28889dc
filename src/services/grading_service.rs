use crate::models::attempt::Attempt;
use crate::models::exam::Exam;
use serde::Serialize;

/// Normalized grading scale.
pub const SCORE_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct ItemGrade {
    pub item_id: String,
    pub answer: Option<String>,
    pub correct_option: Option<String>,
    pub weight: f64,
    pub awarded: f64,
    pub is_correct: bool,
    pub penalized: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub obtained: f64,
    pub total_possible: f64,
    pub raw_score: f64,
    pub penalty_points: f64,
    pub final_score: f64,
    pub items: Vec<ItemGrade>,
}

pub struct GradingService;

impl GradingService {
    /// Weighted score of `attempt` over every item of `exam`, on a 0-10 scale.
    ///
    /// Penalized items stay in the denominator but earn nothing. Penalty points
    /// come off the normalized score, floored at zero.
    pub fn score(exam: &Exam, attempt: &Attempt) -> ScoreBreakdown {
        let mut obtained = 0.0;
        let mut total_possible = 0.0;
        let mut items = Vec::with_capacity(exam.items.len());

        for item in &exam.items {
            let weight = item.weight();
            total_possible += weight;

            let answer = attempt.answers.get(&item.item_id).cloned();
            let correct_option = item.correct_option().map(str::to_string);
            let is_correct = match (&answer, &correct_option) {
                (Some(given), Some(correct)) => given.trim() == correct.trim(),
                _ => false,
            };
            let penalized = attempt.penalized_items.contains(&item.item_id);

            let awarded = if is_correct && !penalized { weight } else { 0.0 };
            obtained += awarded;

            items.push(ItemGrade {
                item_id: item.item_id.clone(),
                answer,
                correct_option,
                weight,
                awarded,
                is_correct,
                penalized,
            });
        }

        let raw_score = if total_possible > 0.0 {
            obtained / total_possible * SCORE_SCALE
        } else {
            0.0
        };
        let penalty_points = attempt.penalty_points.max(0.0);
        let final_score = round2((raw_score - penalty_points).max(0.0));

        ScoreBreakdown {
            obtained,
            total_possible,
            raw_score: round2(raw_score),
            penalty_points,
            final_score,
            items,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam::{ExamItem, ItemOption};
    use chrono::Utc;
    use uuid::Uuid;

    fn item(id: &str, points: Option<f64>, correct: &str) -> ExamItem {
        ExamItem {
            item_id: id.to_string(),
            stem: format!("Question {}", id),
            options: vec![
                ItemOption { text: correct.to_string(), correct: true },
                ItemOption { text: "wrong".to_string(), correct: false },
            ],
            points,
            position: 0,
        }
    }

    fn exam() -> Exam {
        Exam {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            title: "Physics".to_string(),
            duration_seconds: 600,
            shuffle_items: false,
            items: vec![item("q1", Some(6.0), "A"), item("q2", Some(4.0), "B")],
        }
    }

    fn attempt(exam: &Exam) -> Attempt {
        let mut a = Attempt::new(exam.id, "Ana".into(), "123".into(), vec![], Utc::now());
        a.answers.insert("q1".into(), "A".into());
        a.answers.insert("q2".into(), "wrong".into());
        a
    }

    #[test]
    fn weighted_score_on_ten_point_scale() {
        let exam = exam();
        let breakdown = GradingService::score(&exam, &attempt(&exam));
        assert_eq!(breakdown.total_possible, 10.0);
        assert_eq!(breakdown.obtained, 6.0);
        assert_eq!(breakdown.final_score, 6.0);
    }

    #[test]
    fn penalized_items_earn_nothing() {
        let exam = exam();
        let mut a = attempt(&exam);
        a.penalized_items.insert("q2".into());
        assert_eq!(GradingService::score(&exam, &a).final_score, 6.0);

        a.penalized_items.clear();
        a.penalized_items.insert("q1".into());
        let breakdown = GradingService::score(&exam, &a);
        assert_eq!(breakdown.final_score, 0.0);
        assert!(breakdown.items[0].is_correct);
        assert_eq!(breakdown.items[0].awarded, 0.0);
    }

    #[test]
    fn penalty_points_subtract_and_floor_at_zero() {
        let exam = exam();
        let mut a = attempt(&exam);
        a.penalty_points = 2.0;
        assert_eq!(GradingService::score(&exam, &a).final_score, 4.0);
        a.penalty_points = 7.5;
        assert_eq!(GradingService::score(&exam, &a).final_score, 0.0);
    }

    #[test]
    fn missing_weights_default_and_unanswered_count_in_total() {
        let mut exam = exam();
        exam.items.push(item("q3", None, "C"));
        let a = attempt(&exam);
        let breakdown = GradingService::score(&exam, &a);
        assert_eq!(breakdown.total_possible, 11.0);
        assert_eq!(breakdown.raw_score, 5.45);
        assert!(breakdown.items[2].answer.is_none());
    }

    #[test]
    fn outer_whitespace_is_ignored_but_case_is_not() {
        let exam = exam();
        let mut a = attempt(&exam);
        a.answers.insert("q1".into(), "  A\n".into());
        a.answers.insert("q2".into(), "b".into());
        let breakdown = GradingService::score(&exam, &a);
        assert!(breakdown.items[0].is_correct);
        assert!(!breakdown.items[1].is_correct);
        assert_eq!(breakdown.final_score, 6.0);
    }

    #[test]
    fn stored_score_is_rounded_to_cents() {
        let mut exam = exam();
        exam.items = vec![item("q1", Some(1.0), "A"), item("q2", Some(1.0), "B"), item("q3", Some(1.0), "C")];
        let mut a = attempt(&exam);
        a.penalty_points = 0.001;
        let breakdown = GradingService::score(&exam, &a);
        assert_eq!(breakdown.raw_score, 3.33);
        assert_eq!(breakdown.final_score, 3.33);
    }

    #[test]
    fn empty_exam_scores_zero() {
        let mut exam = exam();
        exam.items.clear();
        assert_eq!(GradingService::score(&exam, &attempt(&exam)).final_score, 0.0);
    }
}
