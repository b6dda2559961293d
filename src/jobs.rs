// Background jobs: overdue poller and daily reminder

use crate::deadline::{self, Deadline};
use crate::diff;
use crate::error::{TicketError, TicketResult};
use crate::filter::{Expr, Field};
use crate::models::RequestStatus;
use crate::notify::{Dispatcher, Payload};
use crate::store::{SharedStore, Store, lock};
use chrono::{DateTime, Datelike, Local, Weekday};
use cron::Schedule;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub const MIN_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REMINDER_CRON: &str = "0 0 10 * * Mon-Fri";

pub fn is_weekend(now: &DateTime<Local>) -> bool {
    matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Outcome of one overdue poller tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueCheck {
    pub checked: usize,
    pub updated: usize,
    pub alerts: usize,
}

/// Outcome of one reminder run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderRun {
    pub skipped_weekend: bool,
    pub reminders: usize,
}

/// Notification produced by a job scan: destination chat and text
type Outgoing = (Option<i64>, String);

/// Runs a store scan on the blocking pool
async fn scan<T, F>(store: &SharedStore, work: F) -> Result<T>
where
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
        let store = lock(&store)?;
        work(&store)
    })
    .await
    .context("Store scan task failed")?
}

/// Re-evaluates the overdue flag of every open request.
///
/// Changed flags are persisted. A false to true flip on an in-work request
/// raises an alert, unless it is the weekend or `notify` is off. Alerts are
/// sent after the store lock is released.
pub async fn check_overdue(
    store: &SharedStore,
    dispatcher: &Dispatcher,
    now: DateTime<Local>,
    notify: bool,
) -> Result<OverdueCheck> {
    let now_ms = now.timestamp_millis();
    let weekend = is_weekend(&now);
    let send_alerts = notify && !weekend;

    let (mut result, alerts) = scan(store, move |store| scan_overdue(store, now_ms, send_alerts)).await?;

    result.alerts = alerts.len();
    for (chat, message) in alerts {
        dispatcher.deliver(chat, Payload::Text(message)).await;
    }

    info!(
        checked = result.checked,
        updated = result.updated,
        alerts = result.alerts,
        weekend,
        notify,
        "Overdue check complete"
    );
    Ok(result)
}

fn scan_overdue(store: &Store, now_ms: i64, send_alerts: bool) -> Result<(OverdueCheck, Vec<Outgoing>)> {
    let mut result = OverdueCheck::default();
    let urgencies = store.urgencies_by_id()?;
    let overrides = store.overrides_by_request()?;
    let open = store.select_requests(&Expr::is_in(
        Field::Status,
        RequestStatus::open().map(|s| s.as_str()),
    ))?;

    let mut alerts = Vec::new();
    for request in &open {
        result.checked += 1;
        let deadline = urgencies
            .get(&request.urgency_id)
            .and_then(|u| Deadline::resolve(request.created_at, u, overrides.get(&request.id).copied()));
        let overdue_now = deadline::is_overdue(request, deadline.as_ref(), now_ms);
        if overdue_now == request.is_overdue {
            continue;
        }

        store.set_overdue(request.id, overdue_now)?;
        result.updated += 1;
        debug!(request_id = request.id, is_overdue = overdue_now, status = %request.status, "overdue flag changed");

        if !overdue_now || request.status != RequestStatus::InWork || !send_alerts {
            continue;
        }
        if let Some(deadline) = deadline {
            let days_overdue = deadline.days_overdue(now_ms).max(1);
            let chat = store.chat_for_request(request.id)?;
            alerts.push((chat, diff::overdue_message(request.id, &request.description, days_overdue)));
        }
    }
    Ok((result, alerts))
}

/// Re-alerts on in-work requests still flagged overdue; skipped on weekends
pub async fn send_reminders(store: &SharedStore, dispatcher: &Dispatcher, now: DateTime<Local>) -> Result<ReminderRun> {
    if is_weekend(&now) {
        info!("Weekend, skipping reminders");
        return Ok(ReminderRun {
            skipped_weekend: true,
            reminders: 0,
        });
    }
    let now_ms = now.timestamp_millis();

    let reminders = scan(store, move |store| scan_reminders(store, now_ms)).await?;

    let count = reminders.len();
    for (chat, message) in reminders {
        dispatcher.deliver(chat, Payload::Text(message)).await;
    }

    info!(reminders = count, "Reminder run complete");
    Ok(ReminderRun {
        skipped_weekend: false,
        reminders: count,
    })
}

fn scan_reminders(store: &Store, now_ms: i64) -> Result<Vec<Outgoing>> {
    let urgencies = store.urgencies_by_id()?;
    let overrides = store.overrides_by_request()?;
    let overdue = store.select_requests(&Expr::all([
        Expr::eq(Field::Status, RequestStatus::InWork.as_str()),
        Expr::eq(Field::IsOverdue, true),
    ]))?;

    let mut reminders = Vec::new();
    for request in &overdue {
        let Some(deadline) = urgencies
            .get(&request.urgency_id)
            .and_then(|u| Deadline::resolve(request.created_at, u, overrides.get(&request.id).copied()))
        else {
            continue;
        };
        let days_overdue = deadline.days_overdue(now_ms);
        if days_overdue < 1 {
            continue;
        }
        let chat = store.chat_for_request(request.id)?;
        reminders.push((chat, diff::reminder_message(request.id, &request.description, days_overdue)));
    }
    Ok(reminders)
}

/// Parses a six-field (seconds first) cron expression
pub fn parse_cron(expr: &str) -> TicketResult<Schedule> {
    Schedule::from_str(expr.trim()).map_err(|e| TicketError::invalid(format!("invalid cron expression {:?}: {}", expr, e)))
}

fn check_interval(ms: u64) -> TicketResult<Duration> {
    if ms < MIN_POLL_INTERVAL_MS {
        return Err(TicketError::invalid(format!(
            "poll interval must be at least {} ms, got {}",
            MIN_POLL_INTERVAL_MS, ms
        )));
    }
    Ok(Duration::from_millis(ms))
}

/// Current job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Milliseconds between poller ticks
    pub poll_interval: u64,
    pub reminder_cron: String,
}

struct SchedulerState {
    started: bool,
    poll_interval: Duration,
    reminder_cron: String,
    schedule: Schedule,
    poll_task: Option<JoinHandle<()>>,
    reminder_task: Option<JoinHandle<()>>,
}

struct Inner {
    store: SharedStore,
    dispatcher: Dispatcher,
    clock: fn() -> DateTime<Local>,
    state: Mutex<SchedulerState>,
    // Held for the duration of a run so at most one of each is in flight
    poll_guard: Mutex<()>,
    reminder_guard: Mutex<()>,
}

/// Owns both job tasks and their settings; reconfiguration cancels the
/// running task before the replacement is installed
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: SharedStore, dispatcher: Dispatcher, poll_interval_ms: u64, reminder_cron: &str) -> TicketResult<Self> {
        Self::with_clock(store, dispatcher, poll_interval_ms, reminder_cron, Local::now)
    }

    /// Like [`Scheduler::new`], reading the current time from `clock`
    pub fn with_clock(
        store: SharedStore,
        dispatcher: Dispatcher,
        poll_interval_ms: u64,
        reminder_cron: &str,
        clock: fn() -> DateTime<Local>,
    ) -> TicketResult<Self> {
        let poll_interval = check_interval(poll_interval_ms)?;
        let schedule = parse_cron(reminder_cron)?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                clock,
                state: Mutex::new(SchedulerState {
                    started: false,
                    poll_interval,
                    reminder_cron: reminder_cron.trim().to_string(),
                    schedule,
                    poll_task: None,
                    reminder_task: None,
                }),
                poll_guard: Mutex::new(()),
                reminder_guard: Mutex::new(()),
            }),
        })
    }

    /// Starts both jobs; a second call is a no-op
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        if state.started {
            return;
        }
        state.started = true;
        state.poll_task = Some(self.spawn_poller(state.poll_interval));
        state.reminder_task = Some(self.spawn_reminder(state.schedule.clone()));
        info!(
            poll_interval_ms = state.poll_interval.as_millis() as u64,
            reminder_cron = %state.reminder_cron,
            "Scheduler started"
        );
    }

    pub async fn config(&self) -> SchedulerConfig {
        let state = self.inner.state.lock().await;
        SchedulerConfig {
            poll_interval: state.poll_interval.as_millis() as u64,
            reminder_cron: state.reminder_cron.clone(),
        }
    }

    pub async fn set_poll_interval(&self, ms: u64) -> TicketResult<()> {
        let interval = check_interval(ms)?;

        let mut state = self.inner.state.lock().await;
        // A tick in flight finishes first so its alerts are not dropped
        let _idle = self.inner.poll_guard.lock().await;
        cancel(state.poll_task.take()).await;
        state.poll_interval = interval;
        if state.started {
            state.poll_task = Some(self.spawn_poller(interval));
        }
        info!(poll_interval_ms = ms, "Poll interval changed");
        Ok(())
    }

    /// Replaces the reminder schedule; an invalid expression leaves the
    /// current one running
    pub async fn set_reminder_cron(&self, expr: &str) -> TicketResult<()> {
        let schedule = parse_cron(expr)?;

        let mut state = self.inner.state.lock().await;
        let _idle = self.inner.reminder_guard.lock().await;
        cancel(state.reminder_task.take()).await;
        state.reminder_cron = expr.trim().to_string();
        state.schedule = schedule.clone();
        if state.started {
            state.reminder_task = Some(self.spawn_reminder(schedule));
        }
        info!(reminder_cron = %state.reminder_cron, "Reminder schedule changed");
        Ok(())
    }

    /// One poller tick now
    pub async fn run_overdue_check(&self, notify: bool) -> TicketResult<OverdueCheck> {
        let _running = self.inner.poll_guard.lock().await;
        let span = info_span!("overdue_check", run_id = %Uuid::now_v7());
        let result = check_overdue(&self.inner.store, &self.inner.dispatcher, (self.inner.clock)(), notify)
            .instrument(span)
            .await?;
        Ok(result)
    }

    /// One reminder run now
    pub async fn run_reminders(&self) -> TicketResult<ReminderRun> {
        let _running = self.inner.reminder_guard.lock().await;
        let span = info_span!("reminders", run_id = %Uuid::now_v7());
        let result = send_reminders(&self.inner.store, &self.inner.dispatcher, (self.inner.clock)())
            .instrument(span)
            .await?;
        Ok(result)
    }

    /// Cancels both jobs once any run in flight has finished
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let _idle_poll = self.inner.poll_guard.lock().await;
        let _idle_reminder = self.inner.reminder_guard.lock().await;
        cancel(state.poll_task.take()).await;
        cancel(state.reminder_task.take()).await;
        state.started = false;
        info!("Scheduler stopped");
    }

    /// Fixed-delay loop: the next tick starts `interval` after the previous one ends
    fn spawn_poller(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = scheduler.run_overdue_check(true).await {
                    warn!(error = %e, "Overdue check failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    fn spawn_reminder(&self, schedule: Schedule) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    warn!("Reminder schedule has no upcoming run");
                    return;
                };
                let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(next = %next, "Next reminder run");
                tokio::time::sleep(wait).await;

                if let Err(e) = scheduler.run_reminders().await {
                    warn!(error = %e, "Reminder run failed");
                }
            }
        })
    }
}

/// Aborts an idle job task; callers hold the job's run guard so the task
/// is sleeping or waiting for the guard, never mid-run
async fn cancel(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
        // Wait until the old task is gone before a replacement exists
        let _ = task.await;
    }
}
