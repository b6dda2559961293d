// End-to-end request lifecycle through the public API

use chrono::{Local, TimeZone};
use std::sync::Arc;
use tempfile::TempDir;
use ticketstore::jobs::check_overdue;
use ticketstore::store::{lock, shared};
use ticketstore::{
    Caller, DAY_MS, Dispatcher, ListParams, MemoryGateway, NewRequest, RequestStatus, RequestUpdate, RequestView, Role,
    Store, TicketError, Tickets, UrgencyCategory,
};

struct World {
    _temp: TempDir,
    tickets: Tickets,
    gateway: Arc<MemoryGateway>,
    admin: Caller,
    alice: Caller,
    bob: Caller,
    idle_manager: Caller,
    north: i64,
    category: i64,
    planned: i64,
    custom: i64,
}

fn world() -> World {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path()).unwrap();
    store.seed_defaults().unwrap();

    let admin = store.insert_user("admin", Role::RetailAdmin).unwrap();
    let alice = store.insert_user("alice", Role::Contractor).unwrap();
    let bob = store.insert_user("bob", Role::Contractor).unwrap();
    let idle_manager = store.insert_user("idle", Role::StoreManager).unwrap();
    let north = store.insert_shop("North", None).unwrap();
    let category = store.insert_work_category("HVAC").unwrap();
    store.insert_chat_binding(north, None, 1000).unwrap();
    store.insert_chat_binding(north, Some(alice), 1001).unwrap();

    let urgencies = store.list_all::<UrgencyCategory>().unwrap();
    let find = |name: &str| urgencies.iter().find(|u| u.name == name).unwrap().id;
    let planned = find("Planned");
    let custom = find("Customizable");

    let gateway = Arc::new(MemoryGateway::new());
    let tickets = Tickets::new(shared(store), Dispatcher::new(gateway.clone()));

    World {
        _temp: temp,
        tickets,
        gateway,
        admin: Caller::new(admin, Role::RetailAdmin),
        alice: Caller::new(alice, Role::Contractor),
        bob: Caller::new(bob, Role::Contractor),
        idle_manager: Caller::new(idle_manager, Role::StoreManager),
        north,
        category,
        planned,
        custom,
    }
}

fn create(w: &World, contractor: &Caller, urgency: i64, custom_days: Option<i64>) -> RequestView {
    w.tickets
        .create(
            &w.admin,
            NewRequest {
                description: "Air conditioning not cooling".to_string(),
                shop_id: w.north,
                work_category_id: w.category,
                urgency_id: urgency,
                assigned_contractor_id: Some(contractor.user_id),
                custom_days,
            },
        )
        .unwrap()
}

fn full_update(view: &RequestView, status: RequestStatus, custom_days: Option<i64>) -> RequestUpdate {
    RequestUpdate {
        description: view.description.clone(),
        shop_id: view.shop_id,
        work_category_id: view.work_category_id,
        urgency_id: view.urgency_id,
        assigned_contractor_id: view.assigned_contractor_id,
        status,
        custom_days,
    }
}

fn texts(w: &World) -> Vec<String> {
    w.gateway.deliveries().into_iter().map(|d| d.text).collect()
}

#[tokio::test]
async fn planned_request_goes_overdue_with_single_alert() {
    let w = world();
    let created = create(&w, &w.alice, w.planned, None);
    w.tickets.dispatcher().drain().await;
    let baseline = w.gateway.deliveries().len();

    let wednesday = Local.with_ymd_and_hms(2024, 3, 13, 9, 0, 0).unwrap();
    let now_ms = wednesday.timestamp_millis();
    let store = w.tickets.store().clone();

    // T+13 days: still within the 14-day window
    w.tickets
        .backdate(&w.admin, created.request_id, now_ms - 13 * DAY_MS)
        .unwrap();
    let check = check_overdue(&store, w.tickets.dispatcher(), wednesday, true).await.unwrap();
    assert_eq!(check.alerts, 0);
    assert!(!w.tickets.get(&w.admin, created.request_id).unwrap().is_overdue);

    // T+15 days: one day past the deadline
    w.tickets
        .backdate(&w.admin, created.request_id, now_ms - 15 * DAY_MS)
        .unwrap();
    let check = check_overdue(&store, w.tickets.dispatcher(), wednesday, true).await.unwrap();
    assert_eq!(check.alerts, 1);
    assert!(w.tickets.get(&w.admin, created.request_id).unwrap().is_overdue);

    // Ticking again without elapsed time sends nothing new
    let check = check_overdue(&store, w.tickets.dispatcher(), wednesday, true).await.unwrap();
    assert_eq!(check.alerts, 0);

    let deliveries = w.gateway.deliveries();
    assert_eq!(deliveries.len(), baseline + 1);
    let alert = &deliveries[baseline];
    // Contractor-specific chat wins over the shop-wide one
    assert_eq!(alert.chat_id, 1001);
    assert!(alert.text.contains("1 day ago"));
}

#[tokio::test]
async fn contractor_listing_never_shows_other_contractors() {
    let w = world();
    create(&w, &w.alice, w.planned, None);
    create(&w, &w.bob, w.planned, None);
    create(&w, &w.alice, w.planned, None);

    let params = ListParams {
        status: Some("ALL".to_string()),
        ..Default::default()
    };
    let page = w.tickets.list(&w.bob, &params).unwrap();
    assert_eq!(page.total_items, 1);
    assert!(page.content.iter().all(|v| v.assigned_contractor_id == Some(w.bob.user_id)));

    let page = w.tickets.list(&w.admin, &params).unwrap();
    assert_eq!(page.total_items, 3);
}

#[tokio::test]
async fn manager_without_shops_gets_empty_page() {
    let w = world();
    create(&w, &w.alice, w.planned, None);

    let page = w.tickets.list(&w.idle_manager, &ListParams::default()).unwrap();
    assert!(page.content.is_empty());
    assert_eq!(page.total_items, 0);
    assert_eq!(page.total_pages, 0);
}

#[tokio::test]
async fn sort_keys_fall_back_and_compose() {
    let w = world();
    let first = create(&w, &w.alice, w.planned, None);
    let second = create(&w, &w.bob, w.planned, None);

    let params = ListParams {
        sort: vec!["nonsense,asc".to_string()],
        ..Default::default()
    };
    let ids: Vec<i64> = w
        .tickets
        .list(&w.admin, &params)
        .unwrap()
        .content
        .iter()
        .map(|v| v.request_id)
        .collect();
    assert_eq!(ids, vec![second.request_id, first.request_id]);

    let params = ListParams {
        sort: vec!["assignedContractorName,asc".to_string(), "requestId,desc".to_string()],
        ..Default::default()
    };
    let names: Vec<String> = w
        .tickets
        .list(&w.admin, &params)
        .unwrap()
        .content
        .into_iter()
        .filter_map(|v| v.assigned_contractor_name)
        .collect();
    assert_eq!(names, vec!["alice", "bob"]);
}

#[tokio::test]
async fn customizable_days_update_moves_deadline_only() {
    let w = world();
    let created = create(&w, &w.alice, w.custom, Some(5));
    assert_eq!(created.days_for_task, Some(5));

    let updated = w
        .tickets
        .update(&w.admin, created.request_id, full_update(&created, RequestStatus::InWork, Some(10)))
        .unwrap();
    assert_eq!(updated.days_for_task, Some(10));
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.days_remaining.unwrap() >= 9);

    w.tickets.dispatcher().drain().await;
    assert!(texts(&w).iter().any(|t| t.contains("Custom term \\(5 days\\) → Custom term \\(10 days\\)")));
}

#[tokio::test]
async fn closing_clears_overdue_and_restore_reopens() {
    let w = world();
    let created = create(&w, &w.alice, w.planned, None);
    {
        let store = lock(w.tickets.store()).unwrap();
        store.set_overdue(created.request_id, true).unwrap();
    }

    let closed = w
        .tickets
        .update(&w.admin, created.request_id, full_update(&created, RequestStatus::Closed, None))
        .unwrap();
    assert!(!closed.is_overdue);
    assert!(closed.closed_at.is_some());
    assert_eq!(closed.days_remaining, None);

    let restored = w.tickets.restore(&w.admin, created.request_id).unwrap();
    assert_eq!(restored.status, RequestStatus::InWork);
    assert_eq!(restored.closed_at, None);
    assert!(restored.days_remaining.is_some());

    let err = w.tickets.restore(&w.admin, created.request_id).unwrap_err();
    assert!(matches!(err, TicketError::NotAllowed(_)));
}

#[tokio::test]
async fn complete_then_archive_flow_notifies_create_and_close() {
    let w = world();
    let created = create(&w, &w.alice, w.planned, None);
    w.tickets.dispatcher().drain().await;

    assert!(matches!(
        w.tickets.complete(&w.bob, created.request_id),
        Err(TicketError::NotAllowed(_))
    ));
    let done = w.tickets.complete(&w.alice, created.request_id).unwrap();
    assert_eq!(done.status, RequestStatus::Done);
    w.tickets.dispatcher().drain().await;

    w.tickets
        .update(&w.admin, created.request_id, full_update(&done, RequestStatus::Closed, None))
        .unwrap();

    let archived = ListParams {
        archived: true,
        ..Default::default()
    };
    assert_eq!(w.tickets.list(&w.admin, &archived).unwrap().total_items, 1);
    assert_eq!(w.tickets.list(&w.admin, &ListParams::default()).unwrap().total_items, 0);

    w.tickets.dispatcher().drain().await;
    let texts = texts(&w);
    // Completing is silent; the admin's close is announced as a diff
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("New request"));
    assert!(texts[1].contains("Completed → Closed"));
}
