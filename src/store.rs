// Relational ticket store backed by SQLite

use crate::filter::{Expr, SortKey, order_by_sql};
use crate::models::{CUSTOMIZABLE, ChartPoint, DashboardStats, Request, RequestStatus, Role, UrgencyCategory};
use crate::record::{Literal, Record};
use chrono::{Local, NaiveDate, TimeZone};
use eyre::{Context, Result, eyre};
use fs2::FileExt;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;
const DB_FILE: &str = "ticketstore.db";
const LOCK_FILE: &str = "ticketstore.lock";

/// Length of the dashboard's top-N lists
const DASHBOARD_TOP: i64 = 5;

/// Default urgency classes seeded into a fresh store
pub const DEFAULT_URGENCIES: [(&str, i64); 4] = [("Emergency", 2), ("Urgent", 3), ("Planned", 14), (CUSTOMIZABLE, 40)];

/// Joins shared by listings and job scans; aliases match `Field::to_sql`
const REQUEST_FROM: &str = "FROM requests r
     LEFT JOIN shops s ON s.id = r.shop_id
     LEFT JOIN work_categories wc ON wc.id = r.work_category_id
     LEFT JOIN urgency_categories uc ON uc.id = r.urgency_id
     LEFT JOIN users cu ON cu.id = r.assigned_contractor_id
     LEFT JOIN request_custom_days rcd ON rcd.request_id = r.id";

const REQUEST_COLUMNS: &str = "r.id, r.description, r.shop_id, r.work_category_id, r.urgency_id, r.created_by, \
     r.assigned_contractor_id, r.status, r.created_at, r.closed_at, r.is_overdue";

/// Store shared between request handlers and the background jobs
pub type SharedStore = Arc<Mutex<Store>>;

pub fn shared(store: Store) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Locks a shared store, turning poisoning into an error
pub fn lock(store: &SharedStore) -> Result<MutexGuard<'_, Store>> {
    store.lock().map_err(|_| eyre!("store mutex poisoned"))
}

/// Listing row with references joined in, before deadline figures are computed
#[derive(Debug, Clone)]
pub struct RequestRow {
    pub request: Request,
    pub shop_name: Option<String>,
    pub work_category_name: Option<String>,
    pub urgency: Option<UrgencyCategory>,
    pub override_days: Option<i64>,
    pub contractor_name: Option<String>,
    pub comment_count: i64,
    pub photo_count: i64,
}

/// SQLite-backed store for requests and the reference data they point at
pub struct Store {
    base_path: PathBuf,
    db: Connection,
}

impl Store {
    /// Open or create a store in the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();

        // Create directory if it doesn't exist
        fs::create_dir_all(&base_path).context("Failed to create store directory")?;

        let db_path = base_path.join(DB_FILE);
        let db = Connection::open(&db_path).context("Failed to open SQLite database")?;

        let store = Self { base_path, db };
        store.configure()?;
        store.create_schema()?;
        store.check_version()?;

        debug!(path = ?db_path, "Opened ticket store");
        Ok(store)
    }

    /// Get the directory holding the database
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get a reference to the SQLite database connection
    pub fn db(&self) -> &Connection {
        &self.db
    }

    fn configure(&self) -> Result<()> {
        self.db.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        // Unicode-aware lowercase for free-text search; SQLite's LOWER only folds ASCII
        self.db
            .create_scalar_function(
                "casefold",
                1,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
                |ctx| {
                    let text: Option<String> = ctx.get(0)?;
                    Ok(text.map(|t| t.to_lowercase()))
                },
            )
            .context("Failed to register casefold function")?;
        Ok(())
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        debug!("Creating database schema");

        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                login TEXT NOT NULL UNIQUE,
                role_id INTEGER NOT NULL REFERENCES roles(id)
            );

            CREATE TABLE IF NOT EXISTS shops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                manager_id INTEGER REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS work_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS urgency_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                default_days INTEGER
            );

            CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                shop_id INTEGER NOT NULL REFERENCES shops(id),
                work_category_id INTEGER NOT NULL REFERENCES work_categories(id),
                urgency_id INTEGER NOT NULL REFERENCES urgency_categories(id),
                created_by INTEGER NOT NULL REFERENCES users(id),
                assigned_contractor_id INTEGER REFERENCES users(id),
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                closed_at INTEGER,
                is_overdue INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status, is_overdue);
            CREATE INDEX IF NOT EXISTS idx_requests_shop ON requests(shop_id);
            CREATE INDEX IF NOT EXISTS idx_requests_contractor ON requests(assigned_contractor_id);

            CREATE TABLE IF NOT EXISTS request_custom_days (
                request_id INTEGER PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
                days INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS request_comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS request_photos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
                image BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shop_contractor_chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shop_id INTEGER NOT NULL REFERENCES shops(id),
                contractor_id INTEGER REFERENCES users(id),
                chat_id INTEGER NOT NULL UNIQUE
            );
            "#,
        )?;

        Ok(())
    }

    /// Stamp a fresh database with the schema version, refuse newer ones
    fn check_version(&self) -> Result<()> {
        let version: i64 = self.db.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version == 0 {
            self.db.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        } else if version > SCHEMA_VERSION {
            return Err(eyre!(
                "Store schema version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            ));
        }
        Ok(())
    }

    /// Take the daemon lock; held for as long as the returned file lives
    pub fn lock_exclusive(&self) -> Result<File> {
        let path = self.base_path.join(LOCK_FILE);
        let file = File::create(&path).context("Failed to create lock file")?;
        FileExt::try_lock_exclusive(&file)
            .with_context(|| format!("Another ticketstore daemon holds {}", path.display()))?;
        Ok(file)
    }

    // ========================================================================
    // Reference data
    // ========================================================================

    /// Insert the default roles and urgency categories if absent
    pub fn seed_defaults(&self) -> Result<()> {
        for role in Role::ALL {
            self.ensure_role(role)?;
        }
        for (name, days) in DEFAULT_URGENCIES {
            self.db.execute(
                "INSERT OR IGNORE INTO urgency_categories (name, default_days) VALUES (?1, ?2)",
                params![name, days],
            )?;
        }
        info!("Seeded default roles and urgency categories");
        Ok(())
    }

    fn ensure_role(&self, role: Role) -> Result<i64> {
        self.db
            .execute("INSERT OR IGNORE INTO roles (name) VALUES (?1)", [role.as_str()])?;
        let id = self
            .db
            .query_row("SELECT id FROM roles WHERE name = ?1", [role.as_str()], |row| row.get(0))?;
        Ok(id)
    }

    pub fn insert_user(&self, login: &str, role: Role) -> Result<i64> {
        Self::validate_name(login)?;
        let role_id = self.ensure_role(role)?;
        self.db.execute(
            "INSERT INTO users (login, role_id) VALUES (?1, ?2)",
            params![login, role_id],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn insert_shop(&self, name: &str, manager_id: Option<i64>) -> Result<i64> {
        Self::validate_name(name)?;
        self.db.execute(
            "INSERT INTO shops (name, manager_id) VALUES (?1, ?2)",
            params![name, manager_id],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn insert_work_category(&self, name: &str) -> Result<i64> {
        Self::validate_name(name)?;
        self.db
            .execute("INSERT INTO work_categories (name) VALUES (?1)", [name])?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn insert_urgency(&self, name: &str, default_days: Option<i64>) -> Result<i64> {
        Self::validate_name(name)?;
        if default_days.is_none() && !name.eq_ignore_ascii_case(CUSTOMIZABLE) {
            return Err(eyre!("Urgency category {} requires default days", name));
        }
        if default_days.is_some_and(|d| d < 1) {
            return Err(eyre!("Urgency category {} must have positive default days", name));
        }
        self.db.execute(
            "INSERT INTO urgency_categories (name, default_days) VALUES (?1, ?2)",
            params![name, default_days],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn insert_chat_binding(&self, shop_id: i64, contractor_id: Option<i64>, chat_id: i64) -> Result<i64> {
        self.db.execute(
            "INSERT INTO shop_contractor_chats (shop_id, contractor_id, chat_id) VALUES (?1, ?2, ?3)",
            params![shop_id, contractor_id, chat_id],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    /// Get a reference record by ID
    pub fn get<T: Record>(&self, id: i64) -> Result<Option<T>> {
        let sql = format!("{} WHERE {} = ?1", T::select_sql(), T::id_column());
        let record = self.db.query_row(&sql, [id], T::from_row).optional()?;
        Ok(record)
    }

    /// List every record of a reference table
    pub fn list_all<T: Record>(&self) -> Result<Vec<T>> {
        let sql = format!("{} ORDER BY {}", T::select_sql(), T::id_column());
        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map([], T::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn exists<T: Record>(&self, id: i64) -> Result<bool> {
        Ok(self.get::<T>(id)?.is_some())
    }

    /// Shops whose manager is `user_id`
    pub fn shops_managed_by(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .db
            .prepare("SELECT id FROM shops WHERE manager_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([user_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to load managed shops")
    }

    /// All urgency categories keyed by id, loaded in one query
    pub fn urgencies_by_id(&self) -> Result<HashMap<i64, UrgencyCategory>> {
        Ok(self
            .list_all::<UrgencyCategory>()?
            .into_iter()
            .map(|u| (u.id, u))
            .collect())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Insert a request and its optional day override; returns the new id
    pub fn create_request(&mut self, request: &Request, override_days: Option<i64>) -> Result<i64> {
        Self::validate_description(&request.description)?;

        let tx = self.db.transaction()?;
        tx.execute(
            "INSERT INTO requests (description, shop_id, work_category_id, urgency_id, created_by,
                                   assigned_contractor_id, status, created_at, closed_at, is_overdue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.description,
                request.shop_id,
                request.work_category_id,
                request.urgency_id,
                request.created_by,
                request.assigned_contractor_id,
                request.status.as_str(),
                request.created_at,
                request.closed_at,
                request.is_overdue,
            ],
        )?;
        let id = tx.last_insert_rowid();
        Self::replace_override_tx(&tx, id, override_days)?;
        tx.commit()?;

        debug!(request_id = id, "create_request: inserted");
        Ok(id)
    }

    /// Full-row write of an existing request plus its override row
    pub fn update_request(&mut self, request: &Request, override_days: Option<i64>) -> Result<()> {
        Self::validate_description(&request.description)?;

        let tx = self.db.transaction()?;
        let changed = tx.execute(
            "UPDATE requests
                SET description = ?2, shop_id = ?3, work_category_id = ?4, urgency_id = ?5,
                    assigned_contractor_id = ?6, status = ?7, created_at = ?8, closed_at = ?9, is_overdue = ?10
              WHERE id = ?1",
            params![
                request.id,
                request.description,
                request.shop_id,
                request.work_category_id,
                request.urgency_id,
                request.assigned_contractor_id,
                request.status.as_str(),
                request.created_at,
                request.closed_at,
                request.is_overdue,
            ],
        )?;
        if changed == 0 {
            return Err(eyre!("Request {} does not exist", request.id));
        }
        Self::replace_override_tx(&tx, request.id, override_days)?;
        tx.commit()?;
        Ok(())
    }

    /// Write status-related columns only, leaving the override row alone
    pub fn save_status(&self, request: &Request) -> Result<()> {
        self.db.execute(
            "UPDATE requests SET status = ?2, closed_at = ?3, is_overdue = ?4 WHERE id = ?1",
            params![request.id, request.status.as_str(), request.closed_at, request.is_overdue],
        )?;
        Ok(())
    }

    pub fn set_overdue(&self, request_id: i64, is_overdue: bool) -> Result<()> {
        self.db.execute(
            "UPDATE requests SET is_overdue = ?2 WHERE id = ?1",
            params![request_id, is_overdue],
        )?;
        Ok(())
    }

    /// Rewrite the creation timestamp; returns false for an unknown request
    pub fn set_created_at(&self, request_id: i64, created_at: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE requests SET created_at = ?2 WHERE id = ?1",
            params![request_id, created_at],
        )?;
        Ok(changed > 0)
    }

    pub fn get_request(&self, id: i64) -> Result<Option<Request>> {
        let sql = format!("SELECT {} FROM requests r WHERE r.id = ?1", REQUEST_COLUMNS);
        let request = self.db.query_row(&sql, [id], request_from_row).optional()?;
        Ok(request)
    }

    /// Requests matching `filter`, in id order
    pub fn select_requests(&self, filter: &Expr) -> Result<Vec<Request>> {
        let mut params = Vec::new();
        let predicate = filter.to_sql(&mut params);
        let sql = format!(
            "SELECT {} {} WHERE {} ORDER BY r.id",
            REQUEST_COLUMNS, REQUEST_FROM, predicate
        );

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), request_from_row)?;
        rows.collect::<rusqlite::Result<Vec<Request>>>()
            .context("Failed to load requests")
    }

    /// Number of requests matching `filter`
    pub fn count_requests(&self, filter: &Expr) -> Result<i64> {
        let mut params = Vec::new();
        let predicate = filter.to_sql(&mut params);
        let sql = format!("SELECT COUNT(*) {} WHERE {}", REQUEST_FROM, predicate);
        let count = self
            .db
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count)
    }

    /// One sorted page of joined listing rows
    pub fn query_request_rows(
        &self,
        filter: &Expr,
        sort: &[SortKey],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RequestRow>> {
        let mut params: Vec<Literal> = Vec::new();
        let predicate = filter.to_sql(&mut params);

        let mut sql = format!(
            "SELECT {},
                    s.name, wc.name, uc.id, uc.name, uc.default_days, rcd.days, cu.login,
                    (SELECT COUNT(*) FROM request_comments rc WHERE rc.request_id = r.id),
                    (SELECT COUNT(*) FROM request_photos rp WHERE rp.request_id = r.id)
             {} WHERE {}",
            REQUEST_COLUMNS, REQUEST_FROM, predicate
        );
        sql.push_str(&order_by_sql(sort));
        params.push(Literal::Int(limit));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        params.push(Literal::Int(offset));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        debug!(%sql, param_count = params.len(), "query_request_rows");

        let mut stmt = self.db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let urgency = match row.get::<_, Option<i64>>(13)? {
                Some(id) => Some(UrgencyCategory {
                    id,
                    name: row.get(14)?,
                    default_days: row.get(15)?,
                }),
                None => None,
            };
            Ok(RequestRow {
                request: request_from_row(row)?,
                shop_name: row.get(11)?,
                work_category_name: row.get(12)?,
                urgency,
                override_days: row.get(16)?,
                contractor_name: row.get(17)?,
                comment_count: row.get(18)?,
                photo_count: row.get(19)?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<RequestRow>>>()
            .context("Failed to load request page")
    }

    // ========================================================================
    // Day overrides
    // ========================================================================

    pub fn get_override(&self, request_id: i64) -> Result<Option<i64>> {
        let days = self
            .db
            .query_row(
                "SELECT days FROM request_custom_days WHERE request_id = ?1",
                [request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(days)
    }

    /// Every override keyed by request id, loaded in one query
    pub fn overrides_by_request(&self) -> Result<HashMap<i64, i64>> {
        let mut stmt = self.db.prepare("SELECT request_id, days FROM request_custom_days")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<HashMap<i64, i64>>>()
            .context("Failed to load day overrides")
    }

    /// Delete-then-insert of the override row
    fn replace_override_tx(tx: &rusqlite::Transaction, request_id: i64, days: Option<i64>) -> Result<()> {
        tx.execute("DELETE FROM request_custom_days WHERE request_id = ?1", [request_id])?;
        if let Some(days) = days {
            tx.execute(
                "INSERT INTO request_custom_days (request_id, days) VALUES (?1, ?2)",
                params![request_id, days],
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Comments, photos and chat bindings
    // ========================================================================

    pub fn add_comment(&self, request_id: i64, user_id: i64, text: &str, created_at: i64) -> Result<i64> {
        self.db.execute(
            "INSERT INTO request_comments (request_id, user_id, text, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![request_id, user_id, text, created_at],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn add_photo(&self, request_id: i64, image: &[u8], created_at: i64) -> Result<i64> {
        self.db.execute(
            "INSERT INTO request_photos (request_id, image, created_at) VALUES (?1, ?2, ?3)",
            params![request_id, image, created_at],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    /// Destination chat for a request: the chat bound to the assigned
    /// contractor at the request's shop, else the shop-wide chat
    pub fn chat_for_request(&self, request_id: i64) -> Result<Option<i64>> {
        let chat = self
            .db
            .query_row(
                "SELECT c.chat_id
                   FROM shop_contractor_chats c
                   JOIN requests r ON r.shop_id = c.shop_id
                  WHERE r.id = ?1
                    AND ((r.assigned_contractor_id IS NOT NULL AND c.contractor_id = r.assigned_contractor_id)
                         OR c.contractor_id IS NULL)
                  ORDER BY c.contractor_id IS NULL, c.id
                  LIMIT 1",
                [request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(chat)
    }

    // ========================================================================
    // Dashboard aggregates
    // ========================================================================

    /// Dashboard figures; the daily chart covers requests created at or after `since`
    pub fn dashboard_stats(&self, since: i64) -> Result<DashboardStats> {
        let (total_requests, active_requests, completed_requests, overdue_requests) = self.db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = ?1), 0),
                    COALESCE(SUM(status IN (?2, ?3)), 0),
                    COALESCE(SUM(is_overdue), 0)
               FROM requests",
            params![
                RequestStatus::InWork.as_str(),
                RequestStatus::Done.as_str(),
                RequestStatus::Closed.as_str()
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let by_status = self.grouped_counts(
            "SELECT r.status, COUNT(*) AS n FROM requests r
              GROUP BY r.status ORDER BY n DESC, r.status",
            [],
        )?;
        let by_urgency = self.grouped_counts(
            "SELECT uc.name, COUNT(*) AS n FROM requests r
               JOIN urgency_categories uc ON uc.id = r.urgency_id
              GROUP BY uc.id ORDER BY n DESC, uc.name",
            [],
        )?;
        let by_category = self.grouped_counts(
            "SELECT wc.name, COUNT(*) AS n FROM requests r
               JOIN work_categories wc ON wc.id = r.work_category_id
              GROUP BY wc.id ORDER BY n DESC, wc.name LIMIT ?1",
            [DASHBOARD_TOP],
        )?;
        let top_contractors = self.grouped_counts(
            "SELECT cu.login, COUNT(*) AS n FROM requests r
               JOIN users cu ON cu.id = r.assigned_contractor_id
              WHERE r.status IN (?1, ?2)
              GROUP BY cu.id ORDER BY n DESC, cu.login LIMIT ?3",
            params![RequestStatus::Done.as_str(), RequestStatus::Closed.as_str(), DASHBOARD_TOP],
        )?;

        Ok(DashboardStats {
            total_requests,
            active_requests,
            completed_requests,
            overdue_requests,
            by_status,
            by_urgency,
            by_category,
            last_7_days: self.created_per_day(since)?,
            top_contractors,
        })
    }

    /// Two-column (label, count) query into chart points
    fn grouped_counts<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ChartPoint>> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map(params, |row| Ok(ChartPoint::new(row.get::<_, String>(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<ChartPoint>>>()
            .context("Failed to load dashboard counts")
    }

    /// Creation counts bucketed by local calendar day, oldest first
    fn created_per_day(&self, since: i64) -> Result<Vec<ChartPoint>> {
        let mut stmt = self
            .db
            .prepare("SELECT created_at FROM requests WHERE created_at >= ?1")?;
        let stamps = stmt
            .query_map([since], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;

        let mut days: BTreeMap<NaiveDate, i64> = BTreeMap::new();
        for stamp in stamps {
            if let Some(local) = Local.timestamp_millis_opt(stamp).earliest() {
                *days.entry(local.date_naive()).or_default() += 1;
            }
        }
        Ok(days
            .into_iter()
            .map(|(day, count)| ChartPoint::new(day.format("%d.%m").to_string(), count))
            .collect())
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(eyre!("Name cannot be empty or whitespace-only"));
        }
        if name.chars().count() > 256 {
            return Err(eyre!("Name too long: {} chars (max 256)", name.chars().count()));
        }
        Ok(())
    }

    fn validate_description(description: &str) -> Result<()> {
        if description.trim().is_empty() {
            return Err(eyre!("Description cannot be empty"));
        }
        if description.chars().count() > 2000 {
            return Err(eyre!("Description too long (max 2000 chars)"));
        }
        Ok(())
    }
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    let status: String = row.get(7)?;
    let status = status
        .parse::<RequestStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into()))?;

    Ok(Request {
        id: row.get(0)?,
        description: row.get(1)?,
        shop_id: row.get(2)?,
        work_category_id: row.get(3)?,
        urgency_id: row.get(4)?,
        created_by: row.get(5)?,
        assigned_contractor_id: row.get(6)?,
        status,
        created_at: row.get(8)?,
        closed_at: row.get(9)?,
        is_overdue: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Direction, Field};
    use crate::models::{Shop, User, WorkCategory};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Store,
        admin: i64,
        contractor: i64,
        shop: i64,
        category: i64,
        planned: i64,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        store.seed_defaults().unwrap();
        let admin = store.insert_user("admin", Role::RetailAdmin).unwrap();
        let contractor = store.insert_user("fixer", Role::Contractor).unwrap();
        let shop = store.insert_shop("Central", None).unwrap();
        let category = store.insert_work_category("Plumbing").unwrap();
        let planned = store
            .list_all::<UrgencyCategory>()
            .unwrap()
            .into_iter()
            .find(|u| u.name == "Planned")
            .unwrap()
            .id;
        Fixture {
            _temp: temp,
            store,
            admin,
            contractor,
            shop,
            category,
            planned,
        }
    }

    fn new_request(f: &Fixture, description: &str) -> Request {
        Request {
            id: 0,
            description: description.to_string(),
            shop_id: f.shop,
            work_category_id: f.category,
            urgency_id: f.planned,
            created_by: f.admin,
            assigned_contractor_id: Some(f.contractor),
            status: RequestStatus::InWork,
            created_at: 1_000,
            closed_at: None,
            is_overdue: false,
        }
    }

    #[test]
    fn test_store_open_creates_database() {
        let temp = TempDir::new().unwrap();
        let _store = Store::open(temp.path().join("data")).unwrap();
        assert!(temp.path().join("data").join(DB_FILE).exists());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        {
            let store = Store::open(temp.path()).unwrap();
            store.insert_shop("Central", None).unwrap();
        }
        let store = Store::open(temp.path()).unwrap();
        assert_eq!(store.list_all::<Shop>().unwrap().len(), 1);
    }

    #[test]
    fn test_seed_defaults_is_idempotent() {
        let f = fixture();
        f.store.seed_defaults().unwrap();
        let urgencies = f.store.list_all::<UrgencyCategory>().unwrap();
        assert_eq!(urgencies.len(), 4);
        let custom = urgencies.iter().find(|u| u.is_customizable()).unwrap();
        assert_eq!(custom.default_days, Some(40));
    }

    #[test]
    fn test_get_user_with_role() {
        let f = fixture();
        let user: User = f.store.get(f.contractor).unwrap().unwrap();
        assert_eq!(user.login, "fixer");
        assert_eq!(user.role(), Some(Role::Contractor));

        let missing: Option<User> = f.store.get(999).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_insert_urgency_requires_days() {
        let f = fixture();
        assert!(f.store.insert_urgency("Someday", None).is_err());
        assert!(f.store.insert_urgency("Never", Some(0)).is_err());
        assert!(f.store.insert_urgency("Weekly", Some(7)).is_ok());
    }

    #[test]
    fn test_create_and_get_request() {
        let mut f = fixture();
        let request = new_request(&f, "Fix the sink");
        let id = f.store.create_request(&request, None).unwrap();

        let stored = f.store.get_request(id).unwrap().unwrap();
        assert_eq!(stored.description, "Fix the sink");
        assert_eq!(stored.status, RequestStatus::InWork);
        assert_eq!(stored.assigned_contractor_id, Some(f.contractor));
        assert!(!stored.is_overdue);
        assert!(f.store.get_request(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_create_request_rejects_empty_description() {
        let mut f = fixture();
        let request = new_request(&f, "   ");
        assert!(f.store.create_request(&request, None).is_err());
    }

    #[test]
    fn test_override_replace_and_delete() {
        let mut f = fixture();
        let request = new_request(&f, "Paint wall");
        let id = f.store.create_request(&request, Some(5)).unwrap();
        assert_eq!(f.store.get_override(id).unwrap(), Some(5));

        let mut stored = f.store.get_request(id).unwrap().unwrap();
        f.store.update_request(&stored, Some(10)).unwrap();
        assert_eq!(f.store.get_override(id).unwrap(), Some(10));

        stored.description = "Paint both walls".to_string();
        f.store.update_request(&stored, None).unwrap();
        assert_eq!(f.store.get_override(id).unwrap(), None);
        assert!(f.store.overrides_by_request().unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_request_fails() {
        let mut f = fixture();
        let mut request = new_request(&f, "Ghost");
        request.id = 42;
        assert!(f.store.update_request(&request, None).is_err());
    }

    #[test]
    fn test_select_requests_by_status() {
        let mut f = fixture();
        let open = f.store.create_request(&new_request(&f, "Open one"), None).unwrap();
        let mut closed = new_request(&f, "Closed one");
        closed.status = RequestStatus::Closed;
        f.store.create_request(&closed, None).unwrap();

        let filter = Expr::is_in(Field::Status, RequestStatus::open().map(|s| s.as_str()));
        let found = f.store.select_requests(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, open);
        assert_eq!(f.store.count_requests(&Expr::True).unwrap(), 2);
    }

    #[test]
    fn test_query_rows_join_names_and_counts() {
        let mut f = fixture();
        let id = f.store.create_request(&new_request(&f, "Broken door"), None).unwrap();
        f.store.add_comment(id, f.admin, "On it", 2_000).unwrap();
        f.store.add_comment(id, f.contractor, "Done soon", 3_000).unwrap();
        f.store.add_photo(id, &[1, 2, 3], 4_000).unwrap();

        let rows = f
            .store
            .query_request_rows(&Expr::True, &[SortKey::default_order()], 10, 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.shop_name.as_deref(), Some("Central"));
        assert_eq!(row.work_category_name.as_deref(), Some("Plumbing"));
        assert_eq!(row.contractor_name.as_deref(), Some("fixer"));
        assert_eq!(row.urgency.as_ref().map(|u| u.name.as_str()), Some("Planned"));
        assert_eq!(row.comment_count, 2);
        assert_eq!(row.photo_count, 1);
    }

    #[test]
    fn test_query_rows_paginates_and_sorts() {
        let mut f = fixture();
        for i in 1..=5 {
            f.store
                .create_request(&new_request(&f, &format!("Request {}", i)), None)
                .unwrap();
        }
        let asc = [SortKey {
            field: Field::RequestId,
            direction: Direction::Asc,
        }];
        let page = f.store.query_request_rows(&Expr::True, &asc, 2, 2).unwrap();
        let ids: Vec<i64> = page.iter().map(|r| r.request.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_search_is_case_insensitive_for_unicode() {
        let mut f = fixture();
        f.store
            .create_request(&new_request(&f, "Протекает КРЫША"), None)
            .unwrap();
        f.store.create_request(&new_request(&f, "Door"), None).unwrap();

        let filter = Expr::contains(Field::Description, "крыша");
        assert_eq!(f.store.count_requests(&filter).unwrap(), 1);
    }

    #[test]
    fn test_chat_for_request_prefers_contractor_chat() {
        let mut f = fixture();
        let id = f.store.create_request(&new_request(&f, "Lights"), None).unwrap();
        assert_eq!(f.store.chat_for_request(id).unwrap(), None);

        f.store.insert_chat_binding(f.shop, None, 100).unwrap();
        assert_eq!(f.store.chat_for_request(id).unwrap(), Some(100));

        f.store.insert_chat_binding(f.shop, Some(f.contractor), 200).unwrap();
        assert_eq!(f.store.chat_for_request(id).unwrap(), Some(200));
    }

    #[test]
    fn test_chat_for_request_ignores_other_contractors() {
        let mut f = fixture();
        let other = f.store.insert_user("other", Role::Contractor).unwrap();
        let id = f.store.create_request(&new_request(&f, "Lights"), None).unwrap();
        f.store.insert_chat_binding(f.shop, Some(other), 300).unwrap();
        assert_eq!(f.store.chat_for_request(id).unwrap(), None);
    }

    #[test]
    fn test_shops_managed_by() {
        let f = fixture();
        let manager = f.store.insert_user("boss", Role::StoreManager).unwrap();
        assert!(f.store.shops_managed_by(manager).unwrap().is_empty());
        let north = f.store.insert_shop("North", Some(manager)).unwrap();
        assert_eq!(f.store.shops_managed_by(manager).unwrap(), vec![north]);
        assert!(f.store.exists::<WorkCategory>(f.category).unwrap());
    }

    #[test]
    fn test_daemon_lock_is_exclusive() {
        let f = fixture();
        let _held = f.store.lock_exclusive().unwrap();
        let second = Store::open(f.store.base_path()).unwrap();
        assert!(second.lock_exclusive().is_err());
    }

    #[test]
    fn test_set_created_at() {
        let mut f = fixture();
        let id = f.store.create_request(&new_request(&f, "Backdate"), None).unwrap();
        assert!(f.store.set_created_at(id, 5).unwrap());
        assert_eq!(f.store.get_request(id).unwrap().unwrap().created_at, 5);
        assert!(!f.store.set_created_at(id + 100, 5).unwrap());
    }

    #[test]
    fn test_dashboard_stats_on_empty_store() {
        let f = fixture();
        let stats = f.store.dashboard_stats(0).unwrap();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.completed_requests, 0);
        assert_eq!(stats.overdue_requests, 0);
        assert!(stats.by_status.is_empty());
        assert!(stats.by_urgency.is_empty());
        assert!(stats.last_7_days.is_empty());
        assert!(stats.top_contractors.is_empty());
    }

    #[test]
    fn test_dashboard_stats_counts() {
        let mut f = fixture();
        let electrical = f.store.insert_work_category("Electrical").unwrap();
        let helper = f.store.insert_user("helper", Role::Contractor).unwrap();
        let now = Local
            .with_ymd_and_hms(2026, 6, 10, 12, 0, 0)
            .unwrap()
            .timestamp_millis();
        let day = crate::deadline::DAY_MS;

        let rows = [
            (0, RequestStatus::InWork, f.contractor, f.category, true),
            (1, RequestStatus::Done, f.contractor, f.category, false),
            (1, RequestStatus::Closed, helper, electrical, false),
            (20, RequestStatus::Closed, f.contractor, f.category, false),
        ];
        for (age, status, contractor, category, overdue) in rows {
            let mut request = new_request(&f, "Job");
            request.created_at = now - age * day;
            request.status = status;
            request.assigned_contractor_id = Some(contractor);
            request.work_category_id = category;
            request.is_overdue = overdue;
            f.store.create_request(&request, None).unwrap();
        }

        let stats = f.store.dashboard_stats(now - 7 * day).unwrap();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.active_requests, 1);
        assert_eq!(stats.completed_requests, 3);
        assert_eq!(stats.overdue_requests, 1);
        assert_eq!(
            stats.by_status,
            vec![
                ChartPoint::new("Closed", 2),
                ChartPoint::new("Done", 1),
                ChartPoint::new("In work", 1)
            ]
        );
        assert_eq!(stats.by_urgency, vec![ChartPoint::new("Planned", 4)]);
        assert_eq!(
            stats.by_category,
            vec![ChartPoint::new("Plumbing", 3), ChartPoint::new("Electrical", 1)]
        );
        assert_eq!(
            stats.top_contractors,
            vec![ChartPoint::new("fixer", 2), ChartPoint::new("helper", 1)]
        );
        assert_eq!(
            stats.last_7_days,
            vec![ChartPoint::new("09.06", 2), ChartPoint::new("10.06", 1)]
        );
    }

    #[test]
    fn test_dashboard_top_lists_are_capped() {
        let mut f = fixture();
        for n in 0..7 {
            let category = f.store.insert_work_category(&format!("Category {}", n)).unwrap();
            let mut request = new_request(&f, "Job");
            request.work_category_id = category;
            f.store.create_request(&request, None).unwrap();
        }
        let stats = f.store.dashboard_stats(0).unwrap();
        assert_eq!(stats.total_requests, 7);
        assert_eq!(stats.by_category.len(), 5);
        assert_eq!(stats.by_category[0], ChartPoint::new("Category 0", 1));
    }
}
