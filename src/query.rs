// Filtered, sorted and paginated request listings

use crate::access::AccessScope;
use crate::deadline::{self, Deadline};
use crate::error::{TicketError, TicketResult};
use crate::filter::{Expr, Field, SortKey};
use crate::models::{Page, RequestStatus, RequestView};
use crate::store::{RequestRow, Store};
use eyre::Result;
use tracing::debug;

/// Status value that disables status filtering
pub const ALL_STATUSES: &str = "ALL";

pub const DEFAULT_PAGE_SIZE: i64 = 10;

pub const MAX_PAGE_SIZE: i64 = 1000;

/// Listing parameters as supplied by a caller
#[derive(Debug, Clone, PartialEq)]
pub struct ListParams {
    pub archived: bool,
    pub search_term: Option<String>,
    pub shop_id: Option<i64>,
    pub work_category_id: Option<i64>,
    pub urgency_id: Option<i64>,
    pub contractor_id: Option<i64>,
    pub status: Option<String>,
    pub overdue: bool,
    /// `field,direction` pairs in priority order
    pub sort: Vec<String>,
    pub page: i64,
    pub size: i64,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            archived: false,
            search_term: None,
            shop_id: None,
            work_category_id: None,
            urgency_id: None,
            contractor_id: None,
            status: None,
            overdue: false,
            sort: Vec::new(),
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListParams {
    /// Builds params from raw query pairs; `sort` may repeat, unknown keys are ignored
    pub fn from_pairs<I>(pairs: I) -> TicketResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut params = ListParams::default();
        for (key, value) in pairs {
            match key.as_str() {
                "archived" => params.archived = parse_bool(&key, &value)?,
                "searchTerm" => params.search_term = Some(value),
                "shopId" => params.shop_id = Some(parse_int(&key, &value)?),
                "workCategoryId" => params.work_category_id = Some(parse_int(&key, &value)?),
                "urgencyId" => params.urgency_id = Some(parse_int(&key, &value)?),
                "contractorId" => params.contractor_id = Some(parse_int(&key, &value)?),
                "status" => params.status = Some(value),
                "overdue" => params.overdue = parse_bool(&key, &value)?,
                "sort" => params.sort.push(value),
                "page" => params.page = parse_int(&key, &value)?,
                "size" => params.size = parse_int(&key, &value)?,
                _ => {}
            }
        }

        if params.page < 0 {
            return Err(TicketError::invalid("page must not be negative"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&params.size) {
            return Err(TicketError::invalid(format!(
                "size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, params.size
            )));
        }
        Ok(params)
    }

    /// Status set the listing is restricted to
    pub fn status_predicate(&self) -> Expr {
        if self.archived {
            return Expr::eq(Field::Status, RequestStatus::Closed.as_str());
        }
        match self.status.as_deref().map(str::trim) {
            Some(status) if status.eq_ignore_ascii_case(ALL_STATUSES) => Expr::True,
            Some(status) => match status.parse::<RequestStatus>() {
                Ok(parsed) => Expr::eq(Field::Status, parsed.as_str()),
                // Unknown statuses match nothing rather than everything
                Err(_) => Expr::False,
            },
            None => Expr::is_in(Field::Status, RequestStatus::open().map(|s| s.as_str())),
        }
    }
}

fn parse_int(key: &str, value: &str) -> TicketResult<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| TicketError::invalid(format!("{} must be an integer, got {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> TicketResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(TicketError::invalid(format!("{} must be true or false, got {:?}", key, value))),
    }
}

/// Full predicate: status set, free text, exact filters, then the access scope
pub fn build_predicate(params: &ListParams, scope: &AccessScope) -> Expr {
    let search = params
        .search_term
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map_or(Expr::True, |term| Expr::contains(Field::Description, term));

    Expr::all([
        params.status_predicate(),
        search,
        params
            .work_category_id
            .map_or(Expr::True, |id| Expr::eq(Field::WorkCategoryId, id)),
        params.urgency_id.map_or(Expr::True, |id| Expr::eq(Field::UrgencyId, id)),
        if params.overdue {
            Expr::eq(Field::IsOverdue, true)
        } else {
            Expr::True
        },
        scope.predicate(),
    ])
}

/// One page of enriched requests visible under `scope`
pub fn list_requests(store: &Store, scope: &AccessScope, params: &ListParams, now: i64) -> Result<Page<RequestView>> {
    if scope.is_empty() {
        debug!(?scope, "list_requests: empty scope");
        return Ok(Page::empty(params.page));
    }

    let predicate = build_predicate(params, scope);
    let sort = SortKey::resolve(&params.sort);
    let size = params.size.clamp(1, MAX_PAGE_SIZE);
    let page = params.page.max(0);

    let total_items = store.count_requests(&predicate)?;
    let rows = store.query_request_rows(&predicate, &sort, size, page.saturating_mul(size))?;
    let content: Vec<RequestView> = rows.into_iter().map(|row| view_from_row(row, now)).collect();

    debug!(page, size, total_items, returned = content.len(), "list_requests");

    Ok(Page {
        content,
        current_page: page,
        total_items,
        total_pages: page_count(total_items, size),
    })
}

/// Pages needed for `total_items` rows; `size` is at least 1
fn page_count(total_items: i64, size: i64) -> i64 {
    if total_items <= 0 {
        return 0;
    }
    (total_items - 1) / size + 1
}

/// Single enriched request, regardless of scope
pub fn fetch_view(store: &Store, request_id: i64, now: i64) -> Result<Option<RequestView>> {
    let rows = store.query_request_rows(
        &Expr::eq(Field::RequestId, request_id),
        &[SortKey::default_order()],
        1,
        0,
    )?;
    Ok(rows.into_iter().next().map(|row| view_from_row(row, now)))
}

/// Attaches display names and deadline figures to a joined row
pub fn view_from_row(row: RequestRow, now: i64) -> RequestView {
    let request = row.request;
    let deadline = row
        .urgency
        .as_ref()
        .and_then(|u| Deadline::resolve(request.created_at, u, row.override_days));
    let days_for_task = row
        .urgency
        .as_ref()
        .and_then(|u| deadline::days_for_task(u, row.override_days));

    RequestView {
        request_id: request.id,
        description: request.description,
        shop_id: request.shop_id,
        shop_name: row.shop_name,
        work_category_id: request.work_category_id,
        work_category_name: row.work_category_name,
        urgency_id: request.urgency_id,
        urgency_name: row.urgency.map(|u| u.name),
        assigned_contractor_id: request.assigned_contractor_id,
        assigned_contractor_name: row.contractor_name,
        status: request.status,
        created_at: request.created_at,
        closed_at: request.closed_at,
        days_remaining: deadline::days_remaining(request.status, deadline.as_ref(), now),
        days_for_task,
        is_overdue: request.is_overdue,
        comment_count: row.comment_count,
        photo_count: row.photo_count,
    }
}
