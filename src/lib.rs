// TicketStore - Maintenance request lifecycle and deadline tracking for retail stores

pub mod access;
pub mod api;
pub mod config;
pub mod deadline;
pub mod diff;
pub mod error;
pub mod filter;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod query;
pub mod record;
pub mod store;

// Re-export main types for convenience
pub use access::{AccessScope, Caller};
pub use config::Config;
pub use deadline::{DAY_MS, Deadline, days_for_task};
pub use error::{TicketError, TicketResult};
pub use filter::{Expr, Field, SortKey};
pub use jobs::{OverdueCheck, ReminderRun, Scheduler, SchedulerConfig};
pub use lifecycle::{NewRequest, RequestUpdate, Tickets};
pub use models::{Page, Request, RequestStatus, RequestView, Role, UrgencyCategory, now_ms};
pub use notify::{Dispatcher, Gateway, HttpGateway, MemoryGateway, Payload};
pub use query::ListParams;
pub use record::Record;
pub use store::{SharedStore, Store};
