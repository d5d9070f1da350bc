//! 间隔复习调度
//!
//! 根据掌握等级和答题结果计算下次复习时间，并为复习会话排序。
//! 完全基于本地状态，离线可用。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// 掌握等级上限
pub const MAX_MASTERY_LEVEL: u8 = 7;

/// 按结果等级索引的复习间隔（天），等级 6 及以上使用最后一项
const INTERVAL_DAYS: [i64; 7] = [1, 3, 7, 14, 30, 90, 180];

/// 答错后等级降为 0 时的复习间隔
const RELEARN_INTERVAL_HOURS: i64 = 12;

// ============================================================
// ReviewStatus - 掌握状态
// ============================================================

/// 单词掌握状态，按 new → learning → reviewing → mastered 推进
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    New,
    Learning,
    Reviewing,
    Mastered,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid review status transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ReviewStatus,
    pub to: ReviewStatus,
}

impl ReviewStatus {
    /// 该等级对应的状态
    fn for_level(level: u8) -> Self {
        match level {
            6..=u8::MAX => ReviewStatus::Mastered,
            3..=5 => ReviewStatus::Reviewing,
            _ => ReviewStatus::Learning,
        }
    }

    /// 答错时最多降一级，且不会回到 New
    fn demoted(self) -> Self {
        match self {
            ReviewStatus::Mastered => ReviewStatus::Reviewing,
            ReviewStatus::Reviewing | ReviewStatus::Learning | ReviewStatus::New => {
                ReviewStatus::Learning
            }
        }
    }

    pub fn can_transition_to(self, next: ReviewStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (ReviewStatus::New, ReviewStatus::Learning)
                | (ReviewStatus::New, ReviewStatus::Reviewing)
                | (ReviewStatus::New, ReviewStatus::Mastered)
                | (ReviewStatus::Learning, ReviewStatus::Reviewing)
                | (ReviewStatus::Learning, ReviewStatus::Mastered)
                | (ReviewStatus::Reviewing, ReviewStatus::Mastered)
                | (ReviewStatus::Reviewing, ReviewStatus::Learning)
                | (ReviewStatus::Mastered, ReviewStatus::Reviewing)
        )
    }

    pub fn transition_to(self, next: ReviewStatus) -> Result<ReviewStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

// ============================================================
// 调度计算
// ============================================================

/// 一次复习后的调度结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewSchedule {
    /// 复习后的掌握等级
    pub mastery_level: u8,
    pub interval: Duration,
    pub next_review_at: DateTime<Utc>,
}

/// 复习间隔
///
/// `level_after` 为应用答题结果后的等级。
pub fn review_interval(level_after: u8, was_correct: bool) -> Duration {
    if was_correct {
        let idx = usize::from(level_after).min(INTERVAL_DAYS.len() - 1);
        Duration::days(INTERVAL_DAYS[idx])
    } else if level_after == 0 {
        Duration::hours(RELEARN_INTERVAL_HOURS)
    } else {
        Duration::days(1)
    }
}

/// 计算下次复习时间
///
/// 答对等级加一（上限 7），答错等级减一（下限 0）。超出上限的输入按上限处理。
///
/// # Example
/// ```
/// use chrono::{Duration, Utc};
/// use danci_offline::scheduler::next_review_date;
///
/// let now = Utc::now();
/// let schedule = next_review_date(2, true, now);
/// assert_eq!(schedule.mastery_level, 3);
/// assert_eq!(schedule.next_review_at, now + Duration::days(14));
/// ```
pub fn next_review_date(
    mastery_level: u8,
    was_correct: bool,
    now: DateTime<Utc>,
) -> ReviewSchedule {
    let current = mastery_level.min(MAX_MASTERY_LEVEL);
    let level_after = if was_correct {
        (current + 1).min(MAX_MASTERY_LEVEL)
    } else {
        current.saturating_sub(1)
    };

    let interval = review_interval(level_after, was_correct);

    ReviewSchedule {
        mastery_level: level_after,
        interval,
        next_review_at: now + interval,
    }
}

// ============================================================
// MasteryState - 掌握状态
// ============================================================

/// 单词的复习状态
///
/// `next_review_at` 只由 [`MasteryState::apply_review`] 写入。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteryState {
    #[serde(default)]
    pub status: ReviewStatus,
    #[serde(default)]
    pub mastery_level: u8,
    #[serde(default)]
    pub last_reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_review_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub correct_count: u32,
}

impl MasteryState {
    /// 记录一次复习并更新调度
    pub fn apply_review(&mut self, was_correct: bool, now: DateTime<Utc>) -> ReviewSchedule {
        let schedule = next_review_date(self.mastery_level, was_correct, now);

        self.status = next_status(self.status, schedule.mastery_level, was_correct);
        self.mastery_level = schedule.mastery_level;
        self.last_reviewed_at = Some(now);
        self.next_review_at = Some(schedule.next_review_at);
        self.review_count = self.review_count.saturating_add(1);
        if was_correct {
            self.correct_count = self.correct_count.saturating_add(1);
        }

        schedule
    }

    /// 未安排过复习的视为已到期
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_at.map_or(true, |at| at <= now)
    }

    pub fn accuracy(&self) -> f64 {
        if self.review_count == 0 {
            0.0
        } else {
            f64::from(self.correct_count) / f64::from(self.review_count)
        }
    }
}

fn next_status(current: ReviewStatus, level_after: u8, was_correct: bool) -> ReviewStatus {
    let target = ReviewStatus::for_level(level_after);
    if was_correct {
        current.max(ReviewStatus::Learning).max(target)
    } else {
        target.clamp(current.demoted(), current.max(ReviewStatus::Learning))
    }
}

// ============================================================
// 会话排序
// ============================================================

/// 可参与复习排序的条目
pub trait Reviewable {
    fn mastery(&self) -> &MasteryState;
}

impl Reviewable for MasteryState {
    fn mastery(&self) -> &MasteryState {
        self
    }
}

fn session_order(a: &MasteryState, b: &MasteryState, now: DateTime<Utc>) -> Ordering {
    // 到期的排前面
    b.is_due(now)
        .cmp(&a.is_due(now))
        .then(a.mastery_level.cmp(&b.mastery_level))
        // None（从未复习）最早
        .then(a.last_reviewed_at.cmp(&b.last_reviewed_at))
}

/// 为复习会话排序（稳定排序）
///
/// 到期优先，其次掌握等级低的优先，再次上次复习时间早的优先。
pub fn order_for_session<T: Reviewable>(items: &mut [T], now: DateTime<Utc>) {
    items.sort_by(|a, b| session_order(a.mastery(), b.mastery(), now));
}

/// 构建复习会话：只保留到期条目，排序后截取前 `limit` 个
pub fn build_review_session<T: Reviewable>(
    mut items: Vec<T>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<T> {
    items.retain(|item| item.mastery().is_due(now));
    order_for_session(&mut items, now);
    items.truncate(limit);
    items
}

// ============================================================
// ReviewStats - 复习统计
// ============================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewStats {
    pub total: usize,
    pub new: usize,
    pub learning: usize,
    pub reviewing: usize,
    pub mastered: usize,
    pub due_now: usize,
    pub average_mastery: f64,
}

impl ReviewStats {
    pub fn collect<'a, T, I>(items: I, now: DateTime<Utc>) -> Self
    where
        T: Reviewable + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut stats = ReviewStats::default();
        let mut level_sum: u64 = 0;

        for item in items {
            let mastery = item.mastery();
            stats.total += 1;
            level_sum += u64::from(mastery.mastery_level);
            match mastery.status {
                ReviewStatus::New => stats.new += 1,
                ReviewStatus::Learning => stats.learning += 1,
                ReviewStatus::Reviewing => stats.reviewing += 1,
                ReviewStatus::Mastered => stats.mastered += 1,
            }
            if mastery.is_due(now) {
                stats.due_now += 1;
            }
        }

        if stats.total > 0 {
            stats.average_mastery = level_sum as f64 / stats.total as f64;
        }
        stats
    }
}
