// Data models for TicketStore

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Urgency name that switches deadline resolution to the per-request override
pub const CUSTOMIZABLE: &str = "Customizable";

/// Lifecycle status of a maintenance request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "In work", alias = "InWork")]
    InWork,
    Done,
    Closed,
}

impl RequestStatus {
    /// Value persisted in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::InWork => "In work",
            RequestStatus::Done => "Done",
            RequestStatus::Closed => "Closed",
        }
    }

    /// Statuses that count as open work
    pub fn open() -> [RequestStatus; 2] {
        [RequestStatus::InWork, RequestStatus::Done]
    }

    /// Human-readable label used in outbound messages
    pub fn display_name(&self) -> &'static str {
        match self {
            RequestStatus::InWork => "In progress",
            RequestStatus::Done => "Completed",
            RequestStatus::Closed => "Closed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.chars().filter(|c| !c.is_whitespace() && *c != '_').collect();
        match normalized.to_ascii_lowercase().as_str() {
            "inwork" => Ok(RequestStatus::InWork),
            "done" => Ok(RequestStatus::Done),
            "closed" => Ok(RequestStatus::Closed),
            _ => Err(format!("unknown request status: {}", s)),
        }
    }
}

/// Closed set of roles the engine knows how to scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    RetailAdmin,
    Contractor,
    StoreManager,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Contractor, Role::StoreManager, Role::RetailAdmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::RetailAdmin => "RetailAdmin",
            Role::Contractor => "Contractor",
            Role::StoreManager => "StoreManager",
        }
    }

    /// Maps a stored role name; unmapped names yield `None`
    pub fn from_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.as_str() == name)
    }
}

/// Maintenance request ("ticket")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: i64,
    pub description: String,
    pub shop_id: i64,
    pub work_category_id: i64,
    pub urgency_id: i64,
    pub created_by: i64,
    pub assigned_contractor_id: Option<i64>,
    pub status: RequestStatus,
    /// Milliseconds since epoch
    pub created_at: i64,
    pub closed_at: Option<i64>,
    pub is_overdue: bool,
}

/// Named SLA class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgencyCategory {
    pub id: i64,
    pub name: String,
    /// Only the customizable category may leave this empty
    pub default_days: Option<i64>,
}

impl UrgencyCategory {
    pub fn is_customizable(&self) -> bool {
        self.name.eq_ignore_ascii_case(CUSTOMIZABLE)
    }

    /// Human-readable label used in outbound messages
    pub fn display_name(&self) -> String {
        urgency_display_name(&self.name)
    }
}

/// Translation table for urgency names in outbound messages
pub fn urgency_display_name(name: &str) -> String {
    match name {
        "Emergency" => "Emergency".to_string(),
        "Urgent" => "Urgent".to_string(),
        "Planned" => "Planned".to_string(),
        n if n.eq_ignore_ascii_case(CUSTOMIZABLE) => "Custom term".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: i64,
    pub name: String,
    pub manager_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkCategory {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub login: String,
    pub role_name: String,
}

impl User {
    pub fn role(&self) -> Option<Role> {
        Role::from_name(&self.role_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub request_id: i64,
    pub author: String,
    pub text: String,
    pub created_at: i64,
}

/// Request row as returned by listings: references resolved to display names
/// and the deadline figures computed for the moment of the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub request_id: i64,
    pub description: String,
    pub shop_id: i64,
    pub shop_name: Option<String>,
    pub work_category_id: i64,
    pub work_category_name: Option<String>,
    pub urgency_id: i64,
    pub urgency_name: Option<String>,
    pub assigned_contractor_id: Option<i64>,
    pub assigned_contractor_name: Option<String>,
    pub status: RequestStatus,
    pub created_at: i64,
    pub closed_at: Option<i64>,
    pub days_remaining: Option<i64>,
    pub days_for_task: Option<i64>,
    pub is_overdue: bool,
    pub comment_count: i64,
    pub photo_count: i64,
}

/// One page of results plus totals over the whole filtered set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub current_page: i64,
    pub total_items: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn empty(current_page: i64) -> Self {
        Self {
            content: Vec::new(),
            current_page,
            total_items: 0,
            total_pages: 0,
        }
    }
}

/// One labelled bar of a dashboard chart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartPoint {
    pub label: String,
    pub count: i64,
}

impl ChartPoint {
    pub fn new(label: impl Into<String>, count: i64) -> Self {
        Self {
            label: label.into(),
            count,
        }
    }
}

/// Aggregate figures behind the admin dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_requests: i64,
    pub active_requests: i64,
    /// Done or Closed
    pub completed_requests: i64,
    pub overdue_requests: i64,
    pub by_status: Vec<ChartPoint>,
    pub by_urgency: Vec<ChartPoint>,
    pub by_category: Vec<ChartPoint>,
    /// Requests created per local day, labelled "dd.MM", oldest first
    #[serde(rename = "last7Days")]
    pub last_7_days: Vec<ChartPoint>,
    pub top_contractors: Vec<ChartPoint>,
}

/// Helper function to get current timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms() {
        let ts = now_ms();
        // Should be reasonable timestamp (after year 2020)
        assert!(ts > 1_600_000_000_000);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RequestStatus::InWork).unwrap();
        assert_eq!(json, "\"In work\"");

        let status: RequestStatus = serde_json::from_str("\"Closed\"").unwrap();
        assert_eq!(status, RequestStatus::Closed);

        let status: RequestStatus = serde_json::from_str("\"InWork\"").unwrap();
        assert_eq!(status, RequestStatus::InWork);
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("In work".parse::<RequestStatus>(), Ok(RequestStatus::InWork));
        assert_eq!("in_work".parse::<RequestStatus>(), Ok(RequestStatus::InWork));
        assert_eq!("DONE".parse::<RequestStatus>(), Ok(RequestStatus::Done));
        assert!("archived".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_role_from_name() {
        assert_eq!(Role::from_name("Contractor"), Some(Role::Contractor));
        assert_eq!(Role::from_name("RetailAdmin"), Some(Role::RetailAdmin));
        assert_eq!(Role::from_name("Auditor"), None);
    }

    #[test]
    fn test_customizable_is_case_insensitive() {
        let urgency = UrgencyCategory {
            id: 1,
            name: "customizable".to_string(),
            default_days: None,
        };
        assert!(urgency.is_customizable());
        assert_eq!(urgency.display_name(), "Custom term");
    }

    #[test]
    fn test_page_serializes_camel_case() {
        let page: Page<i64> = Page::empty(3);
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["currentPage"], 3);
        assert_eq!(json["totalItems"], 0);
        assert_eq!(json["totalPages"], 0);
        assert!(json["content"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_dashboard_stats_json_names() {
        let stats = DashboardStats {
            total_requests: 2,
            active_requests: 1,
            completed_requests: 1,
            overdue_requests: 0,
            by_status: vec![ChartPoint::new("Done", 1)],
            by_urgency: Vec::new(),
            by_category: Vec::new(),
            last_7_days: vec![ChartPoint::new("03.10", 2)],
            top_contractors: Vec::new(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalRequests"], 2);
        assert_eq!(json["completedRequests"], 1);
        assert_eq!(json["byStatus"][0]["label"], "Done");
        assert_eq!(json["last7Days"][0]["count"], 2);
        assert!(json["topContractors"].as_array().unwrap().is_empty());
    }
}
