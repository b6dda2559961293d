// Change summaries and outbound message texts

use crate::deadline;
use crate::models::{Request, RequestStatus, Shop, UrgencyCategory, User, WorkCategory, urgency_display_name};
use crate::notify::escape_markdown;
use crate::store::Store;
use eyre::Result;

const DIFF_DESCRIPTION_CHARS: usize = 100;
const ALERT_DESCRIPTION_CHARS: usize = 50;

/// Referenced row: compared by id, shown by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub id: i64,
    pub name: Option<String>,
}

impl Reference {
    pub fn new(id: i64, name: Option<String>) -> Self {
        Self { id, name }
    }

    fn label(&self) -> String {
        or_unset(&self.name, "unknown")
    }
}

/// Snapshot of the fields a change notification talks about
#[derive(Debug, Clone, PartialEq)]
pub struct RequestImage {
    pub status: RequestStatus,
    pub contractor: Option<Reference>,
    pub shop: Reference,
    pub work_category: Reference,
    pub urgency: Reference,
    /// Effective day count for the urgency
    pub days: Option<i64>,
    pub description: String,
}

impl RequestImage {
    pub fn load(store: &Store, request: &Request, override_days: Option<i64>) -> Result<Self> {
        let urgency = store.get::<UrgencyCategory>(request.urgency_id)?;
        let contractor = match request.assigned_contractor_id {
            Some(id) => Some(Reference::new(id, store.get::<User>(id)?.map(|u| u.login))),
            None => None,
        };

        Ok(Self {
            status: request.status,
            contractor,
            shop: Reference::new(request.shop_id, store.get::<Shop>(request.shop_id)?.map(|s| s.name)),
            work_category: Reference::new(
                request.work_category_id,
                store.get::<WorkCategory>(request.work_category_id)?.map(|c| c.name),
            ),
            days: urgency.as_ref().and_then(|u| deadline::days_for_task(u, override_days)),
            urgency: Reference::new(request.urgency_id, urgency.map(|u| u.name)),
            description: request.description.clone(),
        })
    }

    fn urgency_label(&self) -> String {
        let name = self
            .urgency
            .name
            .as_deref()
            .map_or_else(|| "unknown".to_string(), urgency_display_name);
        match self.days {
            Some(days) => format!("{} ({})", name, plural_days(days)),
            None => name,
        }
    }
}

/// One changed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub field: &'static str,
    pub before: String,
    pub after: String,
}

impl Change {
    fn new(field: &'static str, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            field,
            before: before.into(),
            after: after.into(),
        }
    }

    /// Plain-text rendering
    pub fn line(&self) -> String {
        format!("{}: {} → {}", self.field, self.before, self.after)
    }

    fn markdown(&self) -> String {
        format!(
            "*{}:* {} → {}",
            escape_markdown(self.field),
            escape_markdown(&self.before),
            escape_markdown(&self.after)
        )
    }
}

fn or_unset(value: &Option<String>, unset: &str) -> String {
    value.clone().unwrap_or_else(|| unset.to_string())
}

/// Before and after labels of a changed reference; equal names get their ids
fn reference_labels(before: &str, before_id: Option<i64>, after: &str, after_id: Option<i64>) -> (String, String) {
    if before != after {
        return (before.to_string(), after.to_string());
    }
    let tag = |label: &str, id: Option<i64>| match id {
        Some(id) => format!("{} (#{})", label, id),
        None => label.to_string(),
    };
    (tag(before, before_id), tag(after, after_id))
}

fn reference_change(field: &'static str, before: &Reference, after: &Reference) -> Option<Change> {
    if before.id == after.id {
        return None;
    }
    let (from, to) = reference_labels(&before.label(), Some(before.id), &after.label(), Some(after.id));
    Some(Change::new(field, from, to))
}

/// Field-by-field comparison of two images; empty when nothing visible changed
pub fn diff(before: &RequestImage, after: &RequestImage) -> Vec<Change> {
    let mut changes = Vec::new();

    if before.status != after.status {
        changes.push(Change::new(
            "Status",
            before.status.display_name(),
            after.status.display_name(),
        ));
    }
    let contractor_id = |image: &RequestImage| image.contractor.as_ref().map(|c| c.id);
    if contractor_id(before) != contractor_id(after) {
        let label = |image: &RequestImage| {
            image
                .contractor
                .as_ref()
                .map_or_else(|| "not assigned".to_string(), Reference::label)
        };
        let (from, to) = reference_labels(&label(before), contractor_id(before), &label(after), contractor_id(after));
        changes.push(Change::new("Contractor", from, to));
    }
    changes.extend(reference_change("Shop", &before.shop, &after.shop));
    changes.extend(reference_change("Work category", &before.work_category, &after.work_category));
    if before.urgency.id != after.urgency.id || before.days != after.days {
        changes.push(Change::new("Urgency", before.urgency_label(), after.urgency_label()));
    }
    if before.description != after.description {
        changes.push(Change::new(
            "Description",
            truncate(&before.description, DIFF_DESCRIPTION_CHARS),
            truncate(&after.description, DIFF_DESCRIPTION_CHARS),
        ));
    }

    changes
}

/// Cuts `text` to `max` characters, marking the cut with an ellipsis
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut cut: String = text.chars().take(max).collect();
        cut.push_str("...");
        cut
    } else {
        text.to_string()
    }
}

fn plural_days(days: i64) -> String {
    if days.abs() == 1 {
        format!("{} day", days)
    } else {
        format!("{} days", days)
    }
}

// ============================================================================
// Message texts (MarkdownV2; every dynamic part escaped)
// ============================================================================

pub fn created_message(request_id: i64, image: &RequestImage) -> String {
    format!(
        "🆕 *New request \\#{}*\n🏪 *Shop:* {}\n🛠 *Category:* {}\n⏱ *Urgency:* {}\n\n{}",
        request_id,
        escape_markdown(&image.shop.label()),
        escape_markdown(&image.work_category.label()),
        escape_markdown(&image.urgency_label()),
        escape_markdown(&image.description),
    )
}

pub fn update_message(request_id: i64, changes: &[Change]) -> String {
    let body: Vec<String> = changes.iter().map(Change::markdown).collect();
    format!("✏️ *Request \\#{} updated*\n\n{}", request_id, body.join("\n"))
}

pub fn overdue_message(request_id: i64, description: &str, days_overdue: i64) -> String {
    let icon = if days_overdue == 1 { "⚠️" } else { "🔥" };
    format!(
        "{} *REQUEST \\#{} IS OVERDUE*\n\nDeadline passed: *{} ago*\nDescription: {}",
        icon,
        request_id,
        escape_markdown(&plural_days(days_overdue)),
        escape_markdown(&truncate(description, ALERT_DESCRIPTION_CHARS)),
    )
}

pub fn reminder_message(request_id: i64, description: &str, days_overdue: i64) -> String {
    format!(
        "⏰ *Reminder: request \\#{} is still open*\n\nOverdue by *{}*\nDescription: {}",
        request_id,
        escape_markdown(&plural_days(days_overdue)),
        escape_markdown(&truncate(description, ALERT_DESCRIPTION_CHARS)),
    )
}

pub fn comment_message(request_id: i64, author: &str, text: &str) -> String {
    format!(
        "💬 *New comment on request \\#{}*\n👤 *From:* {}\n\n{}",
        request_id,
        escape_markdown(author),
        escape_markdown(text)
    )
}

pub fn photo_caption(request_id: i64, author: &str) -> String {
    format!(
        "📷 *New photo on request \\#{}*\n👤 *Added by:* {}",
        request_id,
        escape_markdown(author)
    )
}
