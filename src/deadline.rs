// Deadline resolution shared by listings, the state machine and the jobs

use crate::models::{Request, RequestStatus, UrgencyCategory};

/// One day in milliseconds
pub const DAY_MS: i64 = 86_400_000;

/// Resolution window for a request, in days
///
/// The override wins only under the customizable urgency; every other
/// category uses its default.
pub fn days_for_task(urgency: &UrgencyCategory, override_days: Option<i64>) -> Option<i64> {
    match override_days {
        Some(days) if urgency.is_customizable() => Some(days),
        _ => urgency.default_days,
    }
}

/// Due moment of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub days_for_task: i64,
    pub due_at: i64,
}

impl Deadline {
    /// Returns `None` when the urgency carries no usable day count or the
    /// due moment does not fit in an i64
    pub fn resolve(created_at: i64, urgency: &UrgencyCategory, override_days: Option<i64>) -> Option<Self> {
        let days = days_for_task(urgency, override_days)?;
        let due_at = days.checked_mul(DAY_MS).and_then(|span| created_at.checked_add(span))?;
        Some(Self {
            days_for_task: days,
            due_at,
        })
    }

    pub fn is_passed(&self, now: i64) -> bool {
        now > self.due_at
    }

    /// Whole days until the deadline, floored (negative once passed)
    pub fn days_remaining(&self, now: i64) -> i64 {
        self.due_at.saturating_sub(now).div_euclid(DAY_MS)
    }

    /// Whole days elapsed since the deadline, floored
    pub fn days_overdue(&self, now: i64) -> i64 {
        now.saturating_sub(self.due_at).div_euclid(DAY_MS)
    }
}

/// Overdue flag as it should be persisted for `request` at `now`
pub fn is_overdue(request: &Request, deadline: Option<&Deadline>, now: i64) -> bool {
    request.status != RequestStatus::Closed && deadline.is_some_and(|d| d.is_passed(now))
}

/// Days left for display; `None` for closed requests
pub fn days_remaining(status: RequestStatus, deadline: Option<&Deadline>, now: i64) -> Option<i64> {
    if status == RequestStatus::Closed {
        return None;
    }
    deadline.map(|d| d.days_remaining(now))
}
