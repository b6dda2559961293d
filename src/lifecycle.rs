// Request state machine: create, update, complete, restore and attachments

use crate::access::{AccessScope, Caller};
use crate::deadline::{self, DAY_MS, Deadline};
use crate::diff::{self, RequestImage};
use crate::error::{TicketError, TicketResult};
use crate::models::{Comment, DashboardStats, Page, Request, RequestStatus, RequestView, Role, Shop, UrgencyCategory, User, WorkCategory, now_ms};
use crate::notify::{Dispatcher, Payload};
use crate::query::{self, ListParams};
use crate::record::Record;
use crate::store::{SharedStore, Store, lock};
use eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const MAX_TEXT_CHARS: usize = 2000;

/// Upper bound for a per-request custom day count (ten years)
pub const MAX_CUSTOM_DAYS: i64 = 3650;

/// Days covered by the dashboard's daily chart
const DASHBOARD_DAYS: i64 = 7;

/// Input of a create operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    pub description: String,
    pub shop_id: i64,
    pub work_category_id: i64,
    pub urgency_id: i64,
    #[serde(default)]
    pub assigned_contractor_id: Option<i64>,
    #[serde(default)]
    pub custom_days: Option<i64>,
}

/// Input of an admin update; replaces every editable field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestUpdate {
    pub description: String,
    pub shop_id: i64,
    pub work_category_id: i64,
    pub urgency_id: i64,
    #[serde(default)]
    pub assigned_contractor_id: Option<i64>,
    pub status: RequestStatus,
    #[serde(default)]
    pub custom_days: Option<i64>,
}

/// Checks that `caller` may add comments or photos to `request`
pub fn check_attachment_access(caller: &Caller, request: &Request) -> TicketResult<()> {
    if request.status == RequestStatus::Closed {
        return Err(TicketError::not_allowed("request is closed"));
    }
    let allowed = match caller.role {
        Some(Role::RetailAdmin) => true,
        Some(Role::Contractor) => request.assigned_contractor_id == Some(caller.user_id),
        _ => false,
    };
    if !allowed {
        return Err(TicketError::not_allowed("you cannot modify this request"));
    }
    Ok(())
}

pub fn can_modify_attachments(caller: &Caller, request: &Request) -> bool {
    check_attachment_access(caller, request).is_ok()
}

/// Interactive request operations over a shared store
#[derive(Clone)]
pub struct Tickets {
    store: SharedStore,
    dispatcher: Dispatcher,
}

impl Tickets {
    pub fn new(store: SharedStore, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Looks up the calling user; unknown ids are unauthenticated
    pub fn caller(&self, user_id: i64) -> TicketResult<Caller> {
        let store = lock(&self.store)?;
        let user = store.get::<User>(user_id)?.ok_or(TicketError::Unauthenticated)?;
        Ok(Caller::from_user(&user))
    }

    pub fn list(&self, caller: &Caller, params: &ListParams) -> TicketResult<Page<RequestView>> {
        let store = lock(&self.store)?;
        let scope = AccessScope::for_caller(&store, caller, params.shop_id, params.contractor_id)?;
        Ok(query::list_requests(&store, &scope, params, now_ms())?)
    }

    /// One enriched request, if the caller's scope covers it
    pub fn get(&self, caller: &Caller, request_id: i64) -> TicketResult<RequestView> {
        let store = lock(&self.store)?;
        let view = query::fetch_view(&store, request_id, now_ms())?
            .ok_or_else(|| TicketError::not_found("request", request_id))?;
        let scope = AccessScope::for_caller(&store, caller, None, None)?;
        if !scope.admits(view.shop_id, view.assigned_contractor_id) {
            return Err(TicketError::not_allowed("request is outside your scope"));
        }
        Ok(view)
    }

    pub fn create(&self, caller: &Caller, input: NewRequest) -> TicketResult<RequestView> {
        validate_text("description", &input.description)?;
        let now = now_ms();

        let (view, chat, message) = {
            let mut store = lock(&self.store)?;
            match caller.role {
                Some(Role::RetailAdmin) => {}
                Some(Role::StoreManager) => {
                    if !store.shops_managed_by(caller.user_id)?.contains(&input.shop_id) {
                        return Err(TicketError::not_allowed("you do not manage this shop"));
                    }
                }
                _ => return Err(TicketError::not_allowed("only administrators and store managers create requests")),
            }

            let urgency = check_references(
                &store,
                input.shop_id,
                input.work_category_id,
                input.urgency_id,
                input.assigned_contractor_id,
            )?;
            let override_days = effective_override(&urgency, input.custom_days)?;

            let mut request = Request {
                id: 0,
                description: input.description,
                shop_id: input.shop_id,
                work_category_id: input.work_category_id,
                urgency_id: input.urgency_id,
                created_by: caller.user_id,
                assigned_contractor_id: input.assigned_contractor_id,
                status: RequestStatus::InWork,
                created_at: now,
                closed_at: None,
                is_overdue: false,
            };
            request.id = store.create_request(&request, override_days)?;

            let image = RequestImage::load(&store, &request, override_days)?;
            let chat = store.chat_for_request(request.id)?;
            (
                enriched(&store, request.id, now)?,
                chat,
                diff::created_message(request.id, &image),
            )
        };

        info!(request_id = view.request_id, created_by = caller.user_id, "Request created");
        self.dispatcher.spawn(chat, Payload::Text(message));
        Ok(view)
    }

    pub fn update(&self, caller: &Caller, request_id: i64, input: RequestUpdate) -> TicketResult<RequestView> {
        if !caller.is_admin() {
            return Err(TicketError::not_allowed("only administrators edit requests"));
        }
        validate_text("description", &input.description)?;
        let now = now_ms();

        let (view, chat, changes) = {
            let mut store = lock(&self.store)?;
            let before = store
                .get_request(request_id)?
                .ok_or_else(|| TicketError::not_found("request", request_id))?;
            let before_image = RequestImage::load(&store, &before, store.get_override(request_id)?)?;

            let urgency = check_references(
                &store,
                input.shop_id,
                input.work_category_id,
                input.urgency_id,
                input.assigned_contractor_id,
            )?;
            let override_days = effective_override(&urgency, input.custom_days)?;

            let mut after = Request {
                description: input.description,
                shop_id: input.shop_id,
                work_category_id: input.work_category_id,
                urgency_id: input.urgency_id,
                assigned_contractor_id: input.assigned_contractor_id,
                status: input.status,
                ..before.clone()
            };
            after.closed_at = match (before.status, after.status) {
                (RequestStatus::Closed, RequestStatus::Closed) => before.closed_at,
                (_, RequestStatus::Closed) => Some(now),
                _ => None,
            };
            after.is_overdue = if after.status == RequestStatus::InWork {
                let deadline = Deadline::resolve(after.created_at, &urgency, override_days);
                deadline::is_overdue(&after, deadline.as_ref(), now)
            } else {
                false
            };

            store.update_request(&after, override_days)?;
            debug!(request_id, from = %before.status, to = %after.status, is_overdue = after.is_overdue, "update");

            let after_image = RequestImage::load(&store, &after, override_days)?;
            let changes = diff::diff(&before_image, &after_image);
            let chat = if changes.is_empty() {
                None
            } else {
                store.chat_for_request(request_id)?
            };
            (enriched(&store, request_id, now)?, chat, changes)
        };

        info!(request_id, changed = changes.len(), "Request updated");
        if !changes.is_empty() {
            self.dispatcher
                .spawn(chat, Payload::Text(diff::update_message(request_id, &changes)));
        }
        Ok(view)
    }

    /// Assigned contractor marks an in-work request done
    pub fn complete(&self, caller: &Caller, request_id: i64) -> TicketResult<RequestView> {
        self.transition(request_id, |request| {
            if request.assigned_contractor_id != Some(caller.user_id) {
                return Err(TicketError::not_allowed("you are not the assigned contractor"));
            }
            if request.status != RequestStatus::InWork {
                return Err(TicketError::not_allowed("only in-work requests can be completed"));
            }
            request.status = RequestStatus::Done;
            Ok(())
        })
    }

    /// Admin reopens a closed request
    pub fn restore(&self, caller: &Caller, request_id: i64) -> TicketResult<RequestView> {
        if !caller.is_admin() {
            return Err(TicketError::not_allowed("only administrators restore requests"));
        }
        self.transition(request_id, |request| {
            if request.status != RequestStatus::Closed {
                return Err(TicketError::not_allowed("only closed requests can be restored"));
            }
            request.status = RequestStatus::InWork;
            request.closed_at = None;
            Ok(())
        })
    }

    /// Status-only change shared by complete and restore. The overdue flag
    /// is left alone and no notification is sent.
    fn transition<F>(&self, request_id: i64, apply: F) -> TicketResult<RequestView>
    where
        F: FnOnce(&mut Request) -> TicketResult<()>,
    {
        let now = now_ms();
        let store = lock(&self.store)?;
        let before = store
            .get_request(request_id)?
            .ok_or_else(|| TicketError::not_found("request", request_id))?;
        let mut after = before.clone();
        apply(&mut after)?;
        store.save_status(&after)?;

        info!(request_id, from = %before.status, to = %after.status, "Request status changed");
        enriched(&store, request_id, now)
    }

    pub fn add_comment(&self, caller: &Caller, request_id: i64, text: &str) -> TicketResult<Comment> {
        validate_text("comment", text)?;
        let now = now_ms();

        let (comment, chat) = {
            let store = lock(&self.store)?;
            let request = self.modifiable_request(&store, caller, request_id)?;
            let author = store
                .get::<User>(caller.user_id)?
                .ok_or(TicketError::Unauthenticated)?;
            let id = store.add_comment(request.id, caller.user_id, text, now)?;
            let comment = Comment {
                id,
                request_id,
                author: author.login,
                text: text.to_string(),
                created_at: now,
            };
            (comment, store.chat_for_request(request_id)?)
        };

        debug!(request_id, comment_id = comment.id, "Comment added");
        let message = diff::comment_message(request_id, &comment.author, &comment.text);
        self.dispatcher.spawn(chat, Payload::Text(message));
        Ok(comment)
    }

    /// Stores a photo and forwards it to the request's chat; returns the photo id
    pub fn add_photo(&self, caller: &Caller, request_id: i64, image: Vec<u8>) -> TicketResult<i64> {
        if image.is_empty() {
            return Err(TicketError::invalid("photo is empty"));
        }
        let now = now_ms();

        let (photo_id, author, chat) = {
            let store = lock(&self.store)?;
            self.modifiable_request(&store, caller, request_id)?;
            let author = store
                .get::<User>(caller.user_id)?
                .ok_or(TicketError::Unauthenticated)?;
            let photo_id = store.add_photo(request_id, &image, now)?;
            (photo_id, author.login, store.chat_for_request(request_id)?)
        };

        debug!(request_id, photo_id, bytes = image.len(), "Photo added");
        let caption = diff::photo_caption(request_id, &author);
        self.dispatcher.spawn(chat, Payload::Photo { caption, image });
        Ok(photo_id)
    }

    fn modifiable_request(&self, store: &Store, caller: &Caller, request_id: i64) -> TicketResult<Request> {
        let request = store
            .get_request(request_id)?
            .ok_or_else(|| TicketError::not_found("request", request_id))?;
        check_attachment_access(caller, &request)?;
        Ok(request)
    }

    /// Admin dashboard figures; the daily chart spans the last seven days
    pub fn dashboard(&self, caller: &Caller) -> TicketResult<DashboardStats> {
        if !caller.is_admin() {
            return Err(TicketError::not_allowed("only administrators view the dashboard"));
        }
        let since = now_ms().saturating_sub(DASHBOARD_DAYS * DAY_MS);
        let store = lock(&self.store)?;
        Ok(store.dashboard_stats(since)?)
    }

    /// Rewrites a request's creation time (operational testing of alerts)
    pub fn backdate(&self, caller: &Caller, request_id: i64, created_at: i64) -> TicketResult<()> {
        if !caller.is_admin() {
            return Err(TicketError::not_allowed("only administrators backdate requests"));
        }
        if !(0..=now_ms()).contains(&created_at) {
            return Err(TicketError::invalid(format!(
                "createdAt must lie between the epoch and now, got {}",
                created_at
            )));
        }
        let store = lock(&self.store)?;
        if !store.set_created_at(request_id, created_at)? {
            return Err(TicketError::not_found("request", request_id));
        }
        info!(request_id, created_at, "Request backdated");
        Ok(())
    }
}

fn validate_text(field: &str, text: &str) -> TicketResult<()> {
    if text.trim().is_empty() {
        return Err(TicketError::invalid(format!("{} cannot be empty", field)));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(TicketError::invalid(format!(
            "{} too long (max {} chars)",
            field, MAX_TEXT_CHARS
        )));
    }
    Ok(())
}

fn require<T: Record>(store: &Store, id: i64) -> TicketResult<T> {
    store.get::<T>(id)?.ok_or_else(|| TicketError::not_found(T::kind(), id))
}

/// Checks every reference of a create/update and returns the urgency
fn check_references(
    store: &Store,
    shop_id: i64,
    work_category_id: i64,
    urgency_id: i64,
    contractor_id: Option<i64>,
) -> TicketResult<UrgencyCategory> {
    let urgency = require::<UrgencyCategory>(store, urgency_id)?;
    require::<Shop>(store, shop_id)?;
    require::<WorkCategory>(store, work_category_id)?;
    if let Some(contractor_id) = contractor_id {
        let contractor = require::<User>(store, contractor_id)?;
        if contractor.role() != Some(Role::Contractor) {
            return Err(TicketError::invalid(format!("user {} is not a contractor", contractor_id)));
        }
    }
    Ok(urgency)
}

/// Override row to persist: kept only under the customizable urgency
fn effective_override(urgency: &UrgencyCategory, custom_days: Option<i64>) -> TicketResult<Option<i64>> {
    if !urgency.is_customizable() {
        return Ok(None);
    }
    match custom_days {
        Some(days) if !(1..=MAX_CUSTOM_DAYS).contains(&days) => Err(TicketError::invalid(format!(
            "customDays must be between 1 and {}, got {}",
            MAX_CUSTOM_DAYS, days
        ))),
        other => Ok(other),
    }
}

fn enriched(store: &Store, request_id: i64, now: i64) -> TicketResult<RequestView> {
    query::fetch_view(store, request_id, now)?
        .ok_or_else(|| TicketError::Internal(eyre!("request {} vanished after write", request_id)))
}
