//! Property-Based Tests for the review scheduler
//!
//! Tests the following invariants:
//! - Level bounds: mastery level stays within [0, MAX_MASTERY_LEVEL]
//! - Monotonic intervals: a higher level never yields a shorter interval after a correct answer
//! - Regression: a wrong answer never raises the level or the status
//! - Ordering: due items always precede items that are not yet due

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use danci_offline::scheduler::{
    build_review_session, next_review_date, order_for_session, review_interval, MasteryState,
    ReviewStatus, MAX_MASTERY_LEVEL,
};

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn arb_now() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..=3650 * 24).prop_map(|hours| base_time() + Duration::hours(hours))
}

fn arb_answers() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..40)
}

fn arb_mastery_state() -> impl Strategy<Value = MasteryState> {
    (
        arb_answers(),
        proptest::option::of(-240i64..=240i64), // next_review_at 相对偏移（小时）
    )
        .prop_map(|(answers, offset)| {
            let mut state = MasteryState::default();
            let mut now = base_time() - Duration::days(365);
            for correct in answers {
                state.apply_review(correct, now);
                now += Duration::days(1);
            }
            if state.review_count > 0 {
                state.next_review_at = offset.map(|h| base_time() + Duration::hours(h));
            }
            state
        })
}

// ============================================================================
// Scheduling properties
// ============================================================================

proptest! {
    #[test]
    fn prop_level_stays_in_bounds(level in 0u8..=u8::MAX, correct in any::<bool>(), now in arb_now()) {
        let schedule = next_review_date(level, correct, now);
        prop_assert!(schedule.mastery_level <= MAX_MASTERY_LEVEL);
        prop_assert!(schedule.next_review_at > now);
        prop_assert_eq!(schedule.next_review_at, now + schedule.interval);
    }

    #[test]
    fn prop_correct_answer_never_lowers_level(level in 0u8..=MAX_MASTERY_LEVEL, now in arb_now()) {
        let schedule = next_review_date(level, true, now);
        prop_assert!(schedule.mastery_level >= level);
        prop_assert_eq!(schedule.mastery_level, (level + 1).min(MAX_MASTERY_LEVEL));
    }

    #[test]
    fn prop_wrong_answer_never_raises_level(level in 0u8..=MAX_MASTERY_LEVEL, now in arb_now()) {
        let schedule = next_review_date(level, false, now);
        prop_assert!(schedule.mastery_level <= level);
        prop_assert!(schedule.interval <= Duration::days(1));
    }

    #[test]
    fn prop_interval_monotonic_in_level(a in 0u8..=MAX_MASTERY_LEVEL, b in 0u8..=MAX_MASTERY_LEVEL) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(review_interval(low, true) <= review_interval(high, true));
    }

    #[test]
    fn prop_review_sequence_counts(answers in arb_answers()) {
        let mut state = MasteryState::default();
        let mut now = base_time();

        for &correct in &answers {
            let before = state.clone();
            let schedule = state.apply_review(correct, now);

            prop_assert_eq!(state.mastery_level, schedule.mastery_level);
            prop_assert_eq!(state.next_review_at, Some(schedule.next_review_at));
            prop_assert_eq!(state.last_reviewed_at, Some(now));
            prop_assert!(state.status != ReviewStatus::New);

            if correct {
                prop_assert!(state.status >= before.status);
            } else {
                prop_assert!(state.status <= before.status.max(ReviewStatus::Learning));
            }
            prop_assert!(before.status.can_transition_to(state.status));

            now = schedule.next_review_at;
        }

        let correct = answers.iter().filter(|&&c| c).count() as u32;
        prop_assert_eq!(state.review_count, answers.len() as u32);
        prop_assert_eq!(state.correct_count, correct);
        prop_assert!(state.accuracy() >= 0.0 && state.accuracy() <= 1.0);
    }
}

// ============================================================================
// Ordering properties
// ============================================================================

proptest! {
    #[test]
    fn prop_due_items_come_first(items in prop::collection::vec(arb_mastery_state(), 0..30)) {
        let now = base_time();
        let mut ordered = items.clone();
        order_for_session(&mut ordered, now);

        prop_assert_eq!(ordered.len(), items.len());
        let first_not_due = ordered.iter().position(|s| !s.is_due(now)).unwrap_or(ordered.len());
        prop_assert!(ordered[first_not_due..].iter().all(|s| !s.is_due(now)));

        for pair in ordered[..first_not_due].windows(2) {
            prop_assert!(pair[0].mastery_level <= pair[1].mastery_level);
        }
    }

    #[test]
    fn prop_session_contains_only_due(
        items in prop::collection::vec(arb_mastery_state(), 0..30),
        limit in 0usize..40,
    ) {
        let now = base_time();
        let due_total = items.iter().filter(|s| s.is_due(now)).count();
        let session = build_review_session(items, now, limit);

        prop_assert_eq!(session.len(), due_total.min(limit));
        prop_assert!(session.iter().all(|s| s.is_due(now)));
    }
}
