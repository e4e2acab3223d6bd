use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::{format_description::well_known::Rfc3339, Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

pub mod auth;
pub mod pdf;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("username already exists")]
    UsernameTaken,
    #[error("pdf rendering failed: {0}")]
    Pdf(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Storage(sqlite_error_string(&err))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub company_name: String,
    /// Multi-line postal address, one line per `\n`.
    pub company_address: String,
    pub vat_number: String,
    pub email: String,
    pub phone: String,
    pub website: String,
    pub invoice_prefix: String,
    pub next_invoice_number: i64,
    pub payment_terms: String,
    pub bank_details: String,
    /// Optional data-URL image (data:image/*;base64,...), as uploaded from the UI.
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    pub accent_color: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub company_name: Option<String>,
    pub company_address: Option<String>,
    pub vat_number: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub invoice_prefix: Option<String>,
    pub next_invoice_number: Option<i64>,
    pub payment_terms: Option<String>,
    pub bank_details: Option<String>,
    // Double Option: absent = keep, null = clear.
    #[serde(default)]
    pub logo: Option<Option<String>>,
    #[serde(default)]
    pub signature: Option<Option<String>>,
    pub accent_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub vat_number: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub vat_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    /// VAT percentage (e.g. 20.0 for the UK standard rate).
    pub vat_rate: f64,
    /// Discount percentage; items without one carry 0.
    #[serde(default)]
    pub discount: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }
}

fn default_invoice_status() -> InvoiceStatus {
    InvoiceStatus::Draft
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    /// Assigned from the settings counter at creation time; never rewritten.
    pub invoice_no: String,
    /// Weak reference: the client may have been deleted since.
    pub client_id: String,
    pub items: Vec<LineItem>,
    pub subtotal: f64,
    pub vat_total: f64,
    pub total: f64,
    #[serde(default = "default_invoice_status")]
    pub status: InvoiceStatus,
    pub issue_date: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub archived_at: Option<String>,
    /// Retention marker (creation + 6 years); nothing purges automatically.
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoice {
    pub client_id: String,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    pub issue_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePatch {
    pub client_id: Option<String>,
    /// Items are replaced wholesale; totals are recomputed whenever this is set.
    pub items: Option<Vec<LineItem>>,
    pub status: Option<InvoiceStatus>,
    pub issue_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<Option<String>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    id: String,
    username: String,
    password: String,
    role: String,
    #[allow(dead_code)]
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceTotals {
    pub subtotal: f64,
    pub vat_total: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_invoices: usize,
    pub total_billed: f64,
    pub total_paid: f64,
    pub outstanding: f64,
}

#[derive(Debug, Clone)]
pub struct InvoicePdfFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

const SETTINGS_ID: &str = "company-settings";
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
const RETENTION_DAYS: i64 = 6 * 365;

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn retention_expiry(now: OffsetDateTime) -> String {
    (now + TimeDuration::days(RETENTION_DAYS))
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn default_settings() -> Settings {
    Settings {
        company_name: "InvoiceGen Ltd".to_string(),
        company_address: "123 Business Street\nLondon, UK\nSW1A 1AA".to_string(),
        vat_number: "GB123456789".to_string(),
        email: "info@invoicegen.com".to_string(),
        phone: "+44 20 1234 5678".to_string(),
        website: "www.invoicegen.com".to_string(),
        invoice_prefix: "INV-".to_string(),
        next_invoice_number: 1,
        payment_terms: "Payment due within 30 days\nBank transfer preferred".to_string(),
        bank_details: "Account Name: InvoiceGen Ltd\nSort Code: 12-34-56\nAccount Number: 12345678"
            .to_string(),
        logo: None,
        signature: None,
        accent_color: "#1e40af".to_string(),
        updated_at: now_iso(),
    }
}

/// Six-digit zero padding; larger counters print unpadded (no truncation).
pub fn format_invoice_no(prefix: &str, next: i64) -> String {
    format!("{}{:06}", prefix, next)
}

/// Line-item aggregation: discount applies to the net amount, VAT on top of that.
/// No rounding between items; callers round at presentation time only.
pub fn compute_totals(items: &[LineItem]) -> InvoiceTotals {
    let mut subtotal = 0.0;
    let mut vat_total = 0.0;
    for item in items {
        let item_subtotal = item.quantity * item.unit_price * (1.0 - item.discount / 100.0);
        let item_vat = item_subtotal * (item.vat_rate / 100.0);
        subtotal += item_subtotal;
        vat_total += item_vat;
    }
    InvoiceTotals {
        subtotal,
        vat_total,
        total: subtotal + vat_total,
    }
}

pub fn compute_dashboard_stats(invoices: &[Invoice]) -> DashboardStats {
    let total_billed: f64 = invoices.iter().map(|inv| inv.total).sum();
    let total_paid: f64 = invoices
        .iter()
        .filter(|inv| inv.status == InvoiceStatus::Paid)
        .map(|inv| inv.total)
        .sum();
    DashboardStats {
        total_invoices: invoices.len(),
        total_billed,
        total_paid,
        outstanding: total_billed - total_paid,
    }
}

fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let ok = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' || ch == ' ';
        out.push(if ok { ch } else { '_' });
    }
    let trimmed = out.trim().to_string();
    if trimmed.is_empty() {
        "invoice".to_string()
    } else {
        trimmed
    }
}

fn sqlite_error_string(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            let message = msg.clone().unwrap_or_else(|| "".to_string());
            format!(
                "sqlite(code={:?}, extended_code={}, msg={})",
                code.code, code.extended_code, message
            )
        }
        other => other.to_string(),
    }
}

fn configure_sqlite(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Apply PRAGMAs on init (outside any transaction).
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            id TEXT PRIMARY KEY NOT NULL,
            invoicePrefix TEXT NOT NULL,
            nextInvoiceNumber INTEGER NOT NULL,
            data_json TEXT NOT NULL,
            updatedAt TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL,
            username TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL,
            role TEXT NOT NULL,
            createdAt TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            createdAt TEXT NOT NULL,
            data_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY NOT NULL,
            invoiceNo TEXT NOT NULL,
            clientId TEXT NOT NULL,
            issueDate TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            dueDate TEXT,
            totalAmount REAL NOT NULL,
            createdAt TEXT NOT NULL,
            data_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_invoices_invoiceNo ON invoices(invoiceNo);
        CREATE INDEX IF NOT EXISTS idx_invoices_clientId ON invoices(clientId);
        CREATE INDEX IF NOT EXISTS idx_clients_name ON clients(name);
        "#,
    )?;
    Ok(())
}

fn ensure_settings_row(conn: &Connection) -> Result<(), rusqlite::Error> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(1) FROM settings WHERE id = ?1",
            params![SETTINGS_ID],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if count > 0 {
        return Ok(());
    }

    let s = default_settings();
    let data_json = serde_json::to_string(&s).unwrap_or_else(|_| "{}".to_string());
    conn.execute(
        "INSERT INTO settings (id, invoicePrefix, nextInvoiceNumber, data_json, updatedAt)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            SETTINGS_ID,
            s.invoice_prefix,
            s.next_invoice_number,
            data_json,
            s.updated_at,
        ],
    )?;
    log::info!("default settings created");
    Ok(())
}

// Idempotent: the UNIQUE constraint on username backs this across process instances.
fn ensure_admin_user(conn: &Connection) -> Result<(), rusqlite::Error> {
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(1) FROM users WHERE username = ?1",
            params![DEFAULT_ADMIN_USERNAME],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if exists > 0 {
        return Ok(());
    }

    let res = conn.execute(
        "INSERT INTO users (id, username, password, role, createdAt) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            DEFAULT_ADMIN_USERNAME,
            auth::hash_password(DEFAULT_ADMIN_PASSWORD),
            "admin",
            now_iso(),
        ],
    );
    match res {
        Ok(_) => {
            log::info!("default admin user created");
            Ok(())
        }
        // Another process won the race; the record exists either way.
        Err(rusqlite::Error::SqliteFailure(code, _))
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[derive(Clone)]
pub struct DbState {
    conn: Arc<Mutex<Connection>>,
    write_lock: Arc<Mutex<()>>,
}

impl DbState {
    pub fn open(path: &Path) -> Result<Self, ApiError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApiError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Fresh private database, used by tests.
    pub fn open_in_memory() -> Result<Self, ApiError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, ApiError> {
        configure_sqlite(&conn)?;
        init_schema(&conn)?;
        ensure_settings_row(&conn)?;
        ensure_admin_user(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn with_read<T, F>(&self, op_name: &'static str, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ApiError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ApiError::Storage("db mutex poisoned".to_string()))?;
            f(&guard).map_err(|e| {
                if let ApiError::Storage(msg) = &e {
                    log::error!("sqlite read failed: op={} error={}", op_name, msg);
                }
                e
            })
        })
        .await
        .map_err(|e| ApiError::Storage(e.to_string()))?
    }

    async fn with_write<T, F>(&self, op_name: &'static str, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, ApiError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let write_lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _wg = write_lock
                .lock()
                .map_err(|_| ApiError::Storage("write mutex poisoned".to_string()))?;
            let mut guard = conn
                .lock()
                .map_err(|_| ApiError::Storage("db mutex poisoned".to_string()))?;
            f(&mut guard).map_err(|e| {
                if let ApiError::Storage(msg) = &e {
                    log::error!("sqlite write failed: op={} error={}", op_name, msg);
                }
                e
            })
        })
        .await
        .map_err(|e| ApiError::Storage(e.to_string()))?
    }
}

fn read_settings_from_conn(conn: &Connection) -> Result<Settings, ApiError> {
    let row = conn
        .query_row(
            "SELECT invoicePrefix, nextInvoiceNumber, updatedAt, data_json FROM settings WHERE id = ?1",
            params![SETTINGS_ID],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((prefix, next, updated_at, data_json)) = row else {
        return Err(ApiError::NotFound("settings"));
    };

    let mut settings: Settings = serde_json::from_str(&data_json)
        .map_err(|e| ApiError::Storage(format!("corrupt settings row: {e}")))?;
    // The scalar columns are authoritative for the allocator state.
    settings.invoice_prefix = prefix;
    settings.next_invoice_number = next;
    settings.updated_at = updated_at;
    Ok(settings)
}

fn write_settings_row(conn: &Connection, settings: &Settings) -> Result<(), rusqlite::Error> {
    let data_json = serde_json::to_string(settings).unwrap_or_else(|_| "{}".to_string());
    conn.execute(
        "UPDATE settings SET invoicePrefix = ?2, nextInvoiceNumber = ?3, data_json = ?4, updatedAt = ?5
         WHERE id = ?1",
        params![
            SETTINGS_ID,
            settings.invoice_prefix,
            settings.next_invoice_number,
            data_json,
            settings.updated_at,
        ],
    )?;
    Ok(())
}

pub async fn get_settings(state: &DbState) -> Result<Settings, ApiError> {
    state.with_read("get_settings", read_settings_from_conn).await
}

pub async fn update_settings(state: &DbState, patch: SettingsPatch) -> Result<Settings, ApiError> {
    state
        .with_write("update_settings", move |conn| {
            let mut current = read_settings_from_conn(conn)?;

            if let Some(v) = patch.company_name {
                current.company_name = v;
            }
            if let Some(v) = patch.company_address {
                current.company_address = v;
            }
            if let Some(v) = patch.vat_number {
                current.vat_number = v;
            }
            if let Some(v) = patch.email {
                current.email = v;
            }
            if let Some(v) = patch.phone {
                current.phone = v;
            }
            if let Some(v) = patch.website {
                current.website = v;
            }
            if let Some(v) = patch.invoice_prefix {
                current.invoice_prefix = v;
            }
            if let Some(v) = patch.next_invoice_number {
                current.next_invoice_number = v;
            }
            if let Some(v) = patch.payment_terms {
                current.payment_terms = v;
            }
            if let Some(v) = patch.bank_details {
                current.bank_details = v;
            }
            if let Some(v) = patch.logo {
                current.logo = v;
            }
            if let Some(v) = patch.signature {
                current.signature = v;
            }
            if let Some(v) = patch.accent_color {
                current.accent_color = v;
            }

            current.updated_at = now_iso();
            write_settings_row(conn, &current)?;
            Ok(current)
        })
        .await
}

/// Formats the number the next creation will assign, without consuming it.
pub async fn preview_next_invoice_number(state: &DbState) -> Result<String, ApiError> {
    state
        .with_read("preview_next_invoice_number", |conn| {
            let (prefix, next_num): (String, i64) = conn.query_row(
                "SELECT invoicePrefix, nextInvoiceNumber FROM settings WHERE id = ?1",
                params![SETTINGS_ID],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(format_invoice_no(&prefix, next_num))
        })
        .await
}

pub async fn get_all_clients(state: &DbState) -> Result<Vec<Client>, ApiError> {
    state
        .with_read("get_all_clients", |conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM clients ORDER BY createdAt DESC")?;
            let mut rows = stmt.query([])?;
            let mut out: Vec<Client> = Vec::new();
            while let Some(row) = rows.next()? {
                let json: String = row.get(0)?;
                if let Ok(c) = serde_json::from_str::<Client>(&json) {
                    out.push(c);
                }
            }
            Ok(out)
        })
        .await
}

fn read_client_by_id(conn: &Connection, id: &str) -> Result<Option<Client>, ApiError> {
    let json: Option<String> = conn
        .query_row("SELECT data_json FROM clients WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    match json {
        Some(j) => Ok(serde_json::from_str::<Client>(&j).ok()),
        None => Ok(None),
    }
}

pub async fn get_client_by_id(state: &DbState, id: String) -> Result<Client, ApiError> {
    state
        .with_read("get_client_by_id", move |conn| {
            read_client_by_id(conn, &id)?.ok_or(ApiError::NotFound("client"))
        })
        .await
}

pub async fn create_client(state: &DbState, input: NewClient) -> Result<Client, ApiError> {
    state
        .with_write("create_client", move |conn| {
            let now = now_iso();
            let created = Client {
                id: Uuid::new_v4().to_string(),
                name: input.name,
                company: input.company,
                email: input.email,
                phone: input.phone,
                address: input.address,
                country: input.country,
                vat_number: input.vat_number,
                created_at: now.clone(),
                updated_at: now,
            };
            let json = serde_json::to_string(&created).unwrap_or_else(|_| "{}".to_string());
            conn.execute(
                "INSERT INTO clients (id, name, email, createdAt, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![created.id, created.name, created.email, created.created_at, json],
            )?;
            Ok(created)
        })
        .await
}

pub async fn update_client(
    state: &DbState,
    id: String,
    patch: serde_json::Value,
) -> Result<Client, ApiError> {
    state
        .with_write("update_client", move |conn| {
            let mut existing =
                read_client_by_id(conn, &id)?.ok_or(ApiError::NotFound("client"))?;

            if let Some(v) = patch.get("name").and_then(|v| v.as_str()) {
                existing.name = v.to_string();
            }
            if let Some(v) = patch.get("company").and_then(|v| v.as_str()) {
                existing.company = v.to_string();
            }
            if let Some(v) = patch.get("email").and_then(|v| v.as_str()) {
                existing.email = v.to_string();
            }
            if let Some(v) = patch.get("phone").and_then(|v| v.as_str()) {
                existing.phone = v.to_string();
            }
            if let Some(v) = patch.get("address").and_then(|v| v.as_str()) {
                existing.address = v.to_string();
            }
            if let Some(v) = patch.get("country").and_then(|v| v.as_str()) {
                existing.country = v.to_string();
            }
            if let Some(v) = patch.get("vatNumber").and_then(|v| v.as_str()) {
                existing.vat_number = v.to_string();
            }
            existing.updated_at = now_iso();

            let json = serde_json::to_string(&existing).unwrap_or_else(|_| "{}".to_string());
            conn.execute(
                "UPDATE clients SET name = ?2, email = ?3, data_json = ?4 WHERE id = ?1",
                params![id, existing.name, existing.email, json],
            )?;
            Ok(existing)
        })
        .await
}

/// Succeeds even when invoices still reference the client (weak reference, no cascade).
pub async fn delete_client(state: &DbState, id: String) -> Result<bool, ApiError> {
    state
        .with_write("delete_client", move |conn| {
            conn.execute("DELETE FROM clients WHERE id = ?1", params![id])?;
            Ok(true)
        })
        .await
}

pub async fn get_all_invoices(state: &DbState) -> Result<Vec<Invoice>, ApiError> {
    state
        .with_read("get_all_invoices", |conn| {
            let mut stmt = conn.prepare("SELECT data_json FROM invoices ORDER BY createdAt DESC")?;
            let mut rows = stmt.query([])?;
            let mut out: Vec<Invoice> = Vec::new();
            while let Some(row) = rows.next()? {
                let json: String = row.get(0)?;
                if let Ok(inv) = serde_json::from_str::<Invoice>(&json) {
                    out.push(inv);
                }
            }
            Ok(out)
        })
        .await
}

fn read_invoice_by_id(conn: &Connection, id: &str) -> Result<Option<Invoice>, ApiError> {
    let json: Option<String> = conn
        .query_row("SELECT data_json FROM invoices WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    match json {
        Some(j) => Ok(serde_json::from_str::<Invoice>(&j).ok()),
        None => Ok(None),
    }
}

pub async fn get_invoice_by_id(state: &DbState, id: String) -> Result<Invoice, ApiError> {
    state
        .with_read("get_invoice_by_id", move |conn| {
            read_invoice_by_id(conn, &id)?.ok_or(ApiError::NotFound("invoice"))
        })
        .await
}

/// Allocates the invoice number and computes totals. The counter read, the insert
/// and the increment commit as one immediate transaction, so concurrent creations
/// can neither duplicate nor skip a number.
pub async fn create_invoice(state: &DbState, input: NewInvoice) -> Result<Invoice, ApiError> {
    state
        .with_write("create_invoice", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut settings = read_settings_from_conn(&tx)?;
            let invoice_no =
                format_invoice_no(&settings.invoice_prefix, settings.next_invoice_number);

            let totals = compute_totals(&input.items);
            let now_dt = OffsetDateTime::now_utc();
            let now = now_iso();
            let created = Invoice {
                id: Uuid::new_v4().to_string(),
                invoice_no,
                client_id: input.client_id,
                items: input.items,
                subtotal: totals.subtotal,
                vat_total: totals.vat_total,
                total: totals.total,
                status: input.status.unwrap_or(InvoiceStatus::Draft),
                issue_date: input.issue_date.unwrap_or_else(now_iso),
                due_date: input.due_date,
                notes: input.notes,
                created_at: now.clone(),
                updated_at: now.clone(),
                archived_at: None,
                expires_at: retention_expiry(now_dt),
            };

            let json = serde_json::to_string(&created).unwrap_or_else(|_| "{}".to_string());
            tx.execute(
                "INSERT INTO invoices (
                    id, invoiceNo, clientId, issueDate, status, dueDate, totalAmount, createdAt, data_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    created.id,
                    created.invoice_no,
                    created.client_id,
                    created.issue_date,
                    created.status.as_str(),
                    created.due_date,
                    created.total,
                    created.created_at,
                    json,
                ],
            )?;

            settings.next_invoice_number += 1;
            settings.updated_at = now;
            write_settings_row(&tx, &settings)?;

            tx.commit()?;
            Ok(created)
        })
        .await
}

pub async fn update_invoice(
    state: &DbState,
    id: String,
    patch: InvoicePatch,
) -> Result<Invoice, ApiError> {
    state
        .with_write("update_invoice", move |conn| {
            let mut existing =
                read_invoice_by_id(conn, &id)?.ok_or(ApiError::NotFound("invoice"))?;

            if let Some(v) = patch.client_id {
                existing.client_id = v;
            }
            if let Some(v) = patch.items {
                existing.items = v;
                let totals = compute_totals(&existing.items);
                existing.subtotal = totals.subtotal;
                existing.vat_total = totals.vat_total;
                existing.total = totals.total;
            }
            if let Some(v) = patch.status {
                existing.status = v;
            }
            if let Some(v) = patch.issue_date {
                existing.issue_date = v;
            }
            if let Some(v) = patch.due_date {
                existing.due_date = v;
            }
            if let Some(v) = patch.notes {
                existing.notes = v;
            }
            existing.updated_at = now_iso();

            let json = serde_json::to_string(&existing).unwrap_or_else(|_| "{}".to_string());
            conn.execute(
                "UPDATE invoices SET clientId = ?2, issueDate = ?3, status = ?4, dueDate = ?5,
                    totalAmount = ?6, data_json = ?7 WHERE id = ?1",
                params![
                    id,
                    existing.client_id,
                    existing.issue_date,
                    existing.status.as_str(),
                    existing.due_date,
                    existing.total,
                    json,
                ],
            )?;
            Ok(existing)
        })
        .await
}

pub async fn delete_invoice(state: &DbState, id: String) -> Result<bool, ApiError> {
    state
        .with_write("delete_invoice", move |conn| {
            conn.execute("DELETE FROM invoices WHERE id = ?1", params![id])?;
            Ok(true)
        })
        .await
}

/// Full scan on every request; nothing is maintained incrementally.
pub async fn get_dashboard_stats(state: &DbState) -> Result<DashboardStats, ApiError> {
    let invoices = get_all_invoices(state).await?;
    Ok(compute_dashboard_stats(&invoices))
}

fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>, ApiError> {
    let row = conn
        .query_row(
            "SELECT id, username, password, role, createdAt FROM users WHERE username = ?1",
            params![username],
            |r| {
                Ok(User {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    password: r.get(2)?,
                    role: r.get(3)?,
                    created_at: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Stateless credential check; no session token is issued. An unknown username
/// reports the same failure as a wrong password.
pub async fn login(state: &DbState, username: String, password: String) -> Result<AuthUser, ApiError> {
    state
        .with_read("login", move |conn| {
            let user =
                find_user_by_username(conn, &username)?.ok_or(ApiError::InvalidCredentials)?;
            if !auth::verify_password(&password, &user.password) {
                return Err(ApiError::InvalidCredentials);
            }
            Ok(AuthUser {
                id: user.id,
                username: user.username,
                role: user.role,
            })
        })
        .await
}

pub async fn change_password(
    state: &DbState,
    username: String,
    current_password: String,
    new_password: String,
) -> Result<(), ApiError> {
    state
        .with_write("change_password", move |conn| {
            let user = find_user_by_username(conn, &username)?.ok_or(ApiError::NotFound("user"))?;
            if !auth::verify_password(&current_password, &user.password) {
                return Err(ApiError::InvalidCredentials);
            }
            conn.execute(
                "UPDATE users SET password = ?2 WHERE username = ?1",
                params![username, auth::hash_password(&new_password)],
            )?;
            Ok(())
        })
        .await
}

pub async fn change_username(
    state: &DbState,
    current_username: String,
    new_username: String,
    password: String,
) -> Result<(), ApiError> {
    state
        .with_write("change_username", move |conn| {
            let user =
                find_user_by_username(conn, &current_username)?.ok_or(ApiError::NotFound("user"))?;
            if !auth::verify_password(&password, &user.password) {
                return Err(ApiError::InvalidCredentials);
            }
            if find_user_by_username(conn, &new_username)?.is_some() {
                return Err(ApiError::UsernameTaken);
            }
            conn.execute(
                "UPDATE users SET username = ?2 WHERE username = ?1",
                params![current_username, new_username],
            )?;
            Ok(())
        })
        .await
}

/// Renders the invoice with the current settings and (if it still exists) the
/// referenced client. An orphaned client reference renders an empty bill-to block.
pub async fn export_invoice_pdf(state: &DbState, id: String) -> Result<InvoicePdfFile, ApiError> {
    let (invoice, settings, client) = state
        .with_read("export_invoice_pdf", move |conn| {
            let invoice = read_invoice_by_id(conn, &id)?.ok_or(ApiError::NotFound("invoice"))?;
            let settings = read_settings_from_conn(conn)?;
            let client = read_client_by_id(conn, &invoice.client_id)?;
            Ok((invoice, settings, client))
        })
        .await?;

    let bytes =
        pdf::generate_pdf_bytes(&invoice, &settings, client.as_ref()).map_err(ApiError::Pdf)?;
    Ok(InvoicePdfFile {
        file_name: format!("{}.pdf", sanitize_filename(&invoice.invoice_no)),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn item(quantity: f64, unit_price: f64, vat_rate: f64, discount: f64) -> LineItem {
        LineItem {
            description: "Consulting".to_string(),
            quantity,
            unit_price,
            vat_rate,
            discount,
        }
    }

    fn new_invoice(client_id: &str, items: Vec<LineItem>) -> NewInvoice {
        NewInvoice {
            client_id: client_id.to_string(),
            items,
            status: None,
            issue_date: None,
            due_date: None,
            notes: String::new(),
        }
    }

    #[test]
    fn totals_match_worked_example() {
        // 2 * 100 * 0.9 = 180 net, 20% VAT = 36.
        let totals = compute_totals(&[item(2.0, 100.0, 20.0, 10.0)]);
        assert_eq!(totals.subtotal, 180.0);
        assert_eq!(totals.vat_total, 36.0);
        assert_eq!(totals.total, 216.0);
    }

    #[test]
    fn totals_empty_items_are_zero() {
        let totals = compute_totals(&[]);
        assert_eq!(totals.subtotal, 0.0);
        assert_eq!(totals.vat_total, 0.0);
        assert_eq!(totals.total, 0.0);
    }

    #[test]
    fn total_is_subtotal_plus_vat() {
        let items = vec![
            item(3.0, 19.99, 20.0, 0.0),
            item(1.0, 450.0, 5.0, 15.0),
            item(12.0, 7.5, 0.0, 0.0),
        ];
        let totals = compute_totals(&items);
        assert_eq!(totals.total, totals.subtotal + totals.vat_total);
        assert!(totals.subtotal >= 0.0 && totals.vat_total >= 0.0);
    }

    #[test]
    fn invoice_number_padding() {
        assert_eq!(format_invoice_no("INV-", 7), "INV-000007");
        assert_eq!(format_invoice_no("INV-", 1_000_000), "INV-1000000");
        assert_eq!(format_invoice_no("ACME/", 42), "ACME/000042");
    }

    #[test]
    fn dashboard_reduction() {
        let mk = |total: f64, status: InvoiceStatus| Invoice {
            id: Uuid::new_v4().to_string(),
            invoice_no: "INV-000001".to_string(),
            client_id: "c1".to_string(),
            items: vec![],
            subtotal: total,
            vat_total: 0.0,
            total,
            status,
            issue_date: "2026-01-01".to_string(),
            due_date: None,
            notes: String::new(),
            created_at: now_iso(),
            updated_at: now_iso(),
            archived_at: None,
            expires_at: now_iso(),
        };
        let invoices = vec![
            mk(100.0, InvoiceStatus::Draft),
            mk(200.0, InvoiceStatus::Paid),
            mk(300.0, InvoiceStatus::Issued),
        ];
        let stats = compute_dashboard_stats(&invoices);
        assert_eq!(stats.total_invoices, 3);
        assert_eq!(stats.total_billed, 600.0);
        assert_eq!(stats.total_paid, 200.0);
        assert_eq!(stats.outstanding, 400.0);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("INV-000007"), "INV-000007");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("   "), "invoice");
    }

    #[tokio::test]
    async fn create_invoice_allocates_sequential_numbers() {
        let state = DbState::open_in_memory().unwrap();
        assert_eq!(preview_next_invoice_number(&state).await.unwrap(), "INV-000001");

        let first = create_invoice(&state, new_invoice("c1", vec![item(2.0, 100.0, 20.0, 10.0)]))
            .await
            .unwrap();
        assert_eq!(first.invoice_no, "INV-000001");
        assert_eq!(first.subtotal, 180.0);
        assert_eq!(first.vat_total, 36.0);
        assert_eq!(first.total, 216.0);
        assert_eq!(first.status, InvoiceStatus::Draft);
        assert!(first.archived_at.is_none());
        assert!(!first.expires_at.is_empty());

        let second = create_invoice(&state, new_invoice("c1", vec![])).await.unwrap();
        assert_eq!(second.invoice_no, "INV-000002");
        assert_eq!(second.total, 0.0);

        let settings = get_settings(&state).await.unwrap();
        assert_eq!(settings.next_invoice_number, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_creations_get_distinct_numbers() {
        let state = DbState::open_in_memory().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                create_invoice(&state, new_invoice("c1", vec![item(1.0, 10.0, 20.0, 0.0)]))
                    .await
                    .unwrap()
                    .invoice_no
            }));
        }
        let mut numbers = HashSet::new();
        for h in handles {
            numbers.insert(h.await.unwrap());
        }
        assert_eq!(numbers.len(), 8);
        assert_eq!(get_settings(&state).await.unwrap().next_invoice_number, 9);
    }

    #[tokio::test]
    async fn preview_does_not_consume_the_counter() {
        let state = DbState::open_in_memory().unwrap();
        let a = preview_next_invoice_number(&state).await.unwrap();
        let b = preview_next_invoice_number(&state).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(get_settings(&state).await.unwrap().next_invoice_number, 1);
    }

    #[tokio::test]
    async fn update_invoice_recomputes_totals_on_item_change() {
        let state = DbState::open_in_memory().unwrap();
        let created = create_invoice(&state, new_invoice("c1", vec![item(1.0, 100.0, 20.0, 0.0)]))
            .await
            .unwrap();
        assert_eq!(created.total, 120.0);

        let patch = InvoicePatch {
            items: Some(vec![item(2.0, 100.0, 20.0, 10.0)]),
            ..Default::default()
        };
        let updated = update_invoice(&state, created.id.clone(), patch).await.unwrap();
        assert_eq!(updated.subtotal, 180.0);
        assert_eq!(updated.vat_total, 36.0);
        assert_eq!(updated.total, 216.0);
        // The assigned number never changes.
        assert_eq!(updated.invoice_no, created.invoice_no);

        let patch = InvoicePatch {
            notes: Some("net 14".to_string()),
            ..Default::default()
        };
        let updated = update_invoice(&state, created.id, patch).await.unwrap();
        assert_eq!(updated.total, 216.0);
        assert_eq!(updated.notes, "net 14");
    }

    #[tokio::test]
    async fn settings_merge_leaves_unpatched_fields() {
        let state = DbState::open_in_memory().unwrap();
        let before = get_settings(&state).await.unwrap();

        let patch = SettingsPatch {
            company_name: Some("Bramble & Co".to_string()),
            ..Default::default()
        };
        let after = update_settings(&state, patch).await.unwrap();
        assert_eq!(after.company_name, "Bramble & Co");
        assert_eq!(after.vat_number, before.vat_number);
        assert_eq!(after.invoice_prefix, before.invoice_prefix);
        assert_eq!(after.next_invoice_number, before.next_invoice_number);

        // Explicit null clears an image; absence keeps it.
        let patch = SettingsPatch {
            logo: Some(Some("data:image/png;base64,AAAA".to_string())),
            ..Default::default()
        };
        let after = update_settings(&state, patch).await.unwrap();
        assert!(after.logo.is_some());
        let patch = SettingsPatch {
            logo: Some(None),
            ..Default::default()
        };
        let after = update_settings(&state, patch).await.unwrap();
        assert!(after.logo.is_none());
    }

    #[tokio::test]
    async fn client_crud_roundtrip() {
        let state = DbState::open_in_memory().unwrap();
        let created = create_client(
            &state,
            NewClient {
                name: "Ada Lovelace".to_string(),
                company: "Analytical Engines".to_string(),
                email: "ada@example.com".to_string(),
                phone: String::new(),
                address: "12 St James's Square\nLondon".to_string(),
                country: "UK".to_string(),
                vat_number: "GB999999999".to_string(),
            },
        )
        .await
        .unwrap();

        let fetched = get_client_by_id(&state, created.id.clone()).await.unwrap();
        assert_eq!(fetched.name, "Ada Lovelace");

        let updated = update_client(
            &state,
            created.id.clone(),
            serde_json::json!({ "email": "ada@engines.example", "country": "GB" }),
        )
        .await
        .unwrap();
        assert_eq!(updated.email, "ada@engines.example");
        assert_eq!(updated.country, "GB");
        assert_eq!(updated.name, "Ada Lovelace");

        assert!(delete_client(&state, created.id.clone()).await.unwrap());
        let err = get_client_by_id(&state, created.id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound("client")));
    }

    #[tokio::test]
    async fn deleting_a_client_orphans_its_invoices() {
        let state = DbState::open_in_memory().unwrap();
        let client = create_client(
            &state,
            NewClient {
                name: "Orphan Ltd".to_string(),
                company: String::new(),
                email: String::new(),
                phone: String::new(),
                address: String::new(),
                country: String::new(),
                vat_number: String::new(),
            },
        )
        .await
        .unwrap();

        let invoice = create_invoice(&state, new_invoice(&client.id, vec![item(1.0, 50.0, 20.0, 0.0)]))
            .await
            .unwrap();

        assert!(delete_client(&state, client.id.clone()).await.unwrap());

        // The invoice survives and still points at the missing record.
        let fetched = get_invoice_by_id(&state, invoice.id).await.unwrap();
        assert_eq!(fetched.client_id, client.id);
        assert!(matches!(
            get_client_by_id(&state, client.id).await.unwrap_err(),
            ApiError::NotFound("client")
        ));
    }

    #[tokio::test]
    async fn default_admin_can_log_in() {
        let state = DbState::open_in_memory().unwrap();
        let user = login(&state, "admin".to_string(), "admin123".to_string())
            .await
            .unwrap();
        assert_eq!(user.username, "admin");
        assert_eq!(user.role, "admin");

        let err = login(&state, "admin".to_string(), "nope".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));

        // Unknown usernames fail the same way.
        let err = login(&state, "ghost".to_string(), "admin123".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }

    #[tokio::test]
    async fn wrong_current_password_leaves_hash_unchanged() {
        let state = DbState::open_in_memory().unwrap();
        let err = change_password(
            &state,
            "admin".to_string(),
            "wrong".to_string(),
            "fresh-secret".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));

        // Old credentials still work, new ones do not.
        login(&state, "admin".to_string(), "admin123".to_string())
            .await
            .unwrap();
        assert!(login(&state, "admin".to_string(), "fresh-secret".to_string())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn change_password_roundtrip() {
        let state = DbState::open_in_memory().unwrap();
        change_password(
            &state,
            "admin".to_string(),
            "admin123".to_string(),
            "fresh-secret".to_string(),
        )
        .await
        .unwrap();

        assert!(login(&state, "admin".to_string(), "admin123".to_string())
            .await
            .is_err());
        login(&state, "admin".to_string(), "fresh-secret".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn username_change_rejects_collision() {
        let state = DbState::open_in_memory().unwrap();

        // Renaming onto an already-taken name fails, even one's own.
        let err = change_username(
            &state,
            "admin".to_string(),
            "admin".to_string(),
            "admin123".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::UsernameTaken));

        let err = change_username(
            &state,
            "admin".to_string(),
            "boss".to_string(),
            "wrong".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
        login(&state, "admin".to_string(), "admin123".to_string())
            .await
            .unwrap();

        change_username(
            &state,
            "admin".to_string(),
            "boss".to_string(),
            "admin123".to_string(),
        )
        .await
        .unwrap();
        login(&state, "boss".to_string(), "admin123".to_string())
            .await
            .unwrap();
        assert!(matches!(
            change_password(
                &state,
                "admin".to_string(),
                "admin123".to_string(),
                "x".to_string()
            )
            .await
            .unwrap_err(),
            ApiError::NotFound("user")
        ));
    }

    #[tokio::test]
    async fn export_pdf_names_file_after_invoice_number() {
        let state = DbState::open_in_memory().unwrap();
        let invoice = create_invoice(&state, new_invoice("c1", vec![item(1.0, 100.0, 20.0, 0.0)]))
            .await
            .unwrap();
        let file = export_invoice_pdf(&state, invoice.id).await.unwrap();
        assert_eq!(file.file_name, "INV-000001.pdf");
        assert!(file.bytes.starts_with(b"%PDF"));
    }
}
