use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use customer_ledger_core::{
    normalize_phone, scan_customer_legitimacy, validate_artifact, verify_table_digests, ArtifactId,
    CustomerId, CustomerRecord, IntegrityIssue, IssueCode, LedgerError, LegitimacyRules,
    RestorePhase, RestoreReport, SaleId, SaleRecord, SnapshotArtifact, SnapshotSummary,
    TABLE_CUSTOMERS, TABLE_SALES,
};
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS customers (
  customer_id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL CHECK (length(trim(first_name)) > 0),
  last_name TEXT NOT NULL CHECK (length(trim(last_name)) > 0),
  email TEXT,
  phone_number TEXT NOT NULL,
  phone_key TEXT NOT NULL CHECK (length(phone_key) > 0),
  account_number TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_customers_phone_key ON customers(phone_key);
CREATE INDEX IF NOT EXISTS idx_customers_created_at ON customers(created_at);

CREATE TABLE IF NOT EXISTS sales (
  sale_id TEXT PRIMARY KEY,
  customer_id TEXT NOT NULL,
  total_cost_cents INTEGER NOT NULL CHECK (total_cost_cents >= 0),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (customer_id) REFERENCES customers(customer_id)
);

CREATE INDEX IF NOT EXISTS idx_sales_customer ON sales(customer_id);

CREATE TABLE IF NOT EXISTS snapshot_artifacts (
  artifact_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  format_version INTEGER NOT NULL,
  reason TEXT NOT NULL,
  actor TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  artifact_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_artifacts_created_at ON snapshot_artifacts(created_at);
";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("integrity violation: {summary}")]
    Integrity { summary: String, issues: Vec<IntegrityIssue> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("restore failed and rolled back: {summary}")]
    FatalRestore { summary: String, issues: Vec<IntegrityIssue> },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for StoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) => Self::Validation(message),
            LedgerError::Serialization(message) => Self::Storage(message),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::Transient(err.to_string())
            }
            Some(ErrorCode::ConstraintViolation)
                if err.to_string().contains("customers.phone_key") =>
            {
                Self::Duplicate(format!(
                    "a customer with the same normalized phone already exists: {err}"
                ))
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    /// Open a SQLite-backed ledger store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|err| {
            StoreError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns [`StoreError`] when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`StoreError`] when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL)?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Persist one validated customer row. The normalized phone key is stored
    /// alongside the raw number and carries a UNIQUE index, so a lost
    /// check-then-insert race surfaces here as [`StoreError::Duplicate`].
    ///
    /// # Errors
    /// Returns [`StoreError`] when validation fails, the normalized phone
    /// collides with an existing row, or the write fails.
    pub fn insert_customer(&mut self, record: &CustomerRecord) -> Result<(), StoreError> {
        record.validate()?;

        let tx = self.conn.transaction()?;
        insert_customer_row(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Load all customers, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError`] when rows cannot be read or decoded.
    pub fn list_customers(&self) -> Result<Vec<CustomerRecord>, StoreError> {
        read_customers(&self.conn)
    }

    /// Fetch one customer by id.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the lookup fails.
    pub fn get_customer(&self, customer_id: CustomerId) -> Result<Option<CustomerRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, first_name, last_name, email, phone_number, account_number,
                    created_by, created_at
             FROM customers
             WHERE customer_id = ?1",
        )?;

        let row = stmt
            .query_row(params![customer_id.to_string()], |row| {
                Ok(RawCustomerRow {
                    customer_id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    email: row.get(3)?,
                    phone_number: row.get(4)?,
                    account_number: row.get(5)?,
                    created_by: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.into_record()?)),
            None => Ok(None),
        }
    }

    /// Persist one validated sale row. The parent customer must exist.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the customer is absent, and other
    /// [`StoreError`] variants when validation or the write fails.
    pub fn insert_sale(&mut self, sale: &SaleRecord) -> Result<(), StoreError> {
        sale.validate()?;

        let tx = self.conn.transaction()?;
        if !customer_exists(&tx, sale.customer_id)? {
            return Err(StoreError::NotFound(format!(
                "customer {} not found",
                sale.customer_id
            )));
        }
        insert_sale_row(&tx, sale)?;
        tx.commit()?;
        Ok(())
    }

    /// Load all sales, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError`] when rows cannot be read or decoded.
    pub fn list_sales(&self) -> Result<Vec<SaleRecord>, StoreError> {
        read_sales(&self.conn)
    }

    /// Capture both critical tables in one read transaction, compute their
    /// digests, and persist the artifact as a write-once JSON document row.
    /// The document is stored size-free; the measured byte length lives in the
    /// `size_bytes` column and is hydrated back onto loaded artifacts.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the capture, validation, serialization, or
    /// write fails.
    pub fn create_snapshot(
        &mut self,
        reason: &str,
        actor: &str,
    ) -> Result<SnapshotArtifact, StoreError> {
        let tx = self.conn.transaction()?;
        let customers = read_customers(&tx)?;
        let sales = read_sales(&tx)?;
        tx.commit()?;

        let mut artifact =
            SnapshotArtifact::build(customers, sales, reason, actor, OffsetDateTime::now_utc())?;

        let document = serde_json::to_string(&artifact).map_err(|err| {
            StoreError::Storage(format!("failed to serialize snapshot artifact: {err}"))
        })?;
        let size_bytes = u64::try_from(document.len())
            .map_err(|_| StoreError::Storage("snapshot artifact size overflow".to_string()))?;

        self.conn.execute(
            "INSERT INTO snapshot_artifacts(
                artifact_id, created_at, format_version, reason, actor, size_bytes, artifact_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.artifact_id.to_string(),
                rfc3339(artifact.created_at)?,
                i64::from(artifact.format_version),
                artifact.metadata.reason,
                artifact.metadata.actor,
                size_bytes,
                document,
            ],
        )?;

        artifact.metadata.size_bytes = Some(size_bytes);
        Ok(artifact)
    }

    /// List stored snapshot summaries, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError`] when rows cannot be read or decoded.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_json, size_bytes FROM snapshot_artifacts
             ORDER BY created_at DESC, artifact_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let document: String = row.get(0)?;
            let size_bytes: u64 = row.get(1)?;
            let artifact = parse_artifact_document(&document, size_bytes)?;
            summaries.push(artifact.summary());
        }

        Ok(summaries)
    }

    /// Fetch one stored snapshot artifact by id, size hydrated.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the lookup or decoding fails.
    pub fn get_snapshot(
        &self,
        artifact_id: ArtifactId,
    ) -> Result<Option<SnapshotArtifact>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_json, size_bytes FROM snapshot_artifacts WHERE artifact_id = ?1",
        )?;
        let row = stmt
            .query_row(params![artifact_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })
            .optional()?;

        match row {
            Some((document, size_bytes)) => {
                Ok(Some(parse_artifact_document(&document, size_bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Run the full pre-restore validation of a stored artifact and return the
    /// complete issue list (empty means the artifact is restorable).
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the artifact is absent, and other
    /// variants when decoding fails.
    pub fn validate_snapshot(
        &self,
        artifact_id: ArtifactId,
        rules: &LegitimacyRules,
    ) -> Result<Vec<IntegrityIssue>, StoreError> {
        let artifact = self
            .get_snapshot(artifact_id)?
            .ok_or_else(|| StoreError::NotFound(format!("snapshot artifact {artifact_id} not found")))?;
        Ok(validate_artifact(&artifact, rules)?)
    }

    /// Store an externally produced artifact as a new row, after the same
    /// fail-closed validation a restore would run.
    ///
    /// # Errors
    /// Returns [`StoreError::Integrity`] when validation finds issues,
    /// [`StoreError::Duplicate`] when the artifact id is already stored, and
    /// other variants when the write fails.
    pub fn import_artifact(
        &mut self,
        artifact: &SnapshotArtifact,
        rules: &LegitimacyRules,
    ) -> Result<SnapshotSummary, StoreError> {
        let issues = validate_artifact(artifact, rules)?;
        if !issues.is_empty() {
            return Err(StoreError::Integrity {
                summary: format!(
                    "{} integrity issue(s) found in imported artifact {}",
                    issues.len(),
                    artifact.artifact_id
                ),
                issues,
            });
        }

        if self.get_snapshot(artifact.artifact_id)?.is_some() {
            return Err(StoreError::Duplicate(format!(
                "snapshot artifact {} is already stored",
                artifact.artifact_id
            )));
        }

        let mut stored = artifact.clone();
        stored.metadata.size_bytes = None;
        let document = serde_json::to_string(&stored).map_err(|err| {
            StoreError::Storage(format!("failed to serialize snapshot artifact: {err}"))
        })?;
        let size_bytes = u64::try_from(document.len())
            .map_err(|_| StoreError::Storage("snapshot artifact size overflow".to_string()))?;

        self.conn.execute(
            "INSERT INTO snapshot_artifacts(
                artifact_id, created_at, format_version, reason, actor, size_bytes, artifact_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stored.artifact_id.to_string(),
                rfc3339(stored.created_at)?,
                i64::from(stored.format_version),
                stored.metadata.reason,
                stored.metadata.actor,
                size_bytes,
                document,
            ],
        )?;

        stored.metadata.size_bytes = Some(size_bytes);
        Ok(stored.summary())
    }

    /// Replace the live tables with the contents of a stored artifact.
    ///
    /// The sequence is strict: confirmation token gate, full pre-validation,
    /// safety snapshot of the current live state, then one transaction that
    /// clears child-before-parent, loads parent-before-child, and re-verifies
    /// digests and legitimacy over the now-live rows before committing. Any
    /// failure after the clear rolls the transaction back entirely.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] when the confirmation token does not
    /// match the artifact id, [`StoreError::NotFound`] when the artifact is
    /// absent, [`StoreError::Integrity`] when pre-validation finds issues, and
    /// [`StoreError::FatalRestore`] when the load or in-transaction
    /// verification fails.
    pub fn restore_snapshot(
        &mut self,
        artifact_id: ArtifactId,
        confirmation_token: &str,
        actor: &str,
        rules: &LegitimacyRules,
    ) -> Result<RestoreReport, StoreError> {
        let mut phases = vec![RestorePhase::Requested];

        if confirmation_token.trim().is_empty() {
            return Err(StoreError::Validation(
                "confirmation token MUST be provided for a restore".to_string(),
            ));
        }
        if confirmation_token != artifact_id.to_string() {
            return Err(StoreError::Validation(format!(
                "confirmation token does not match artifact id {artifact_id}"
            )));
        }
        if actor.trim().is_empty() {
            return Err(StoreError::Validation(
                "actor MUST be provided for a restore".to_string(),
            ));
        }

        let artifact = self
            .get_snapshot(artifact_id)?
            .ok_or_else(|| StoreError::NotFound(format!("snapshot artifact {artifact_id} not found")))?;

        let issues = validate_artifact(&artifact, rules)?;
        if !issues.is_empty() {
            return Err(StoreError::Integrity {
                summary: format!(
                    "{} integrity issue(s) found in snapshot {artifact_id}",
                    issues.len()
                ),
                issues,
            });
        }
        phases.push(RestorePhase::Validated);

        let safety = self
            .create_snapshot(&format!("safety snapshot before restore of {artifact_id}"), actor)?;
        phases.push(RestorePhase::SafetySnapshot);

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sales", [])?;
        tx.execute("DELETE FROM customers", [])?;
        phases.push(RestorePhase::Cleared);

        for record in &artifact.tables.customers {
            if let Err(err) = insert_customer_row(&tx, record) {
                return Err(fatal_load(artifact_id, TABLE_CUSTOMERS, &err));
            }
        }
        for sale in &artifact.tables.sales {
            if let Err(err) = insert_sale_row(&tx, sale) {
                return Err(fatal_load(artifact_id, TABLE_SALES, &err));
            }
        }
        phases.push(RestorePhase::Loaded);

        let live_customers = read_customers(&tx)?;
        let live_sales = read_sales(&tx)?;
        let mut post_issues =
            verify_table_digests(&live_customers, &live_sales, &artifact.metadata.tables)?;
        post_issues.extend(scan_customer_legitimacy(&live_customers, rules));
        if !post_issues.is_empty() {
            return Err(StoreError::FatalRestore {
                summary: format!(
                    "{} integrity issue(s) detected after loading snapshot {artifact_id}",
                    post_issues.len()
                ),
                issues: post_issues,
            });
        }
        phases.push(RestorePhase::Verified);

        tx.commit()?;
        phases.push(RestorePhase::Committed);

        Ok(RestoreReport {
            artifact_id,
            safety_artifact_id: safety.artifact_id,
            committed_counts: BTreeMap::from([
                (TABLE_CUSTOMERS.to_string(), artifact.tables.customers.len()),
                (TABLE_SALES.to_string(), artifact.tables.sales.len()),
            ]),
            phases,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns [`StoreError`] when backup directories cannot be created or the
    /// backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), StoreError> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Storage(format!(
                    "failed to create parent directory for backup file {}: {err}",
                    out_file.display()
                ))
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None)?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns [`StoreError`] when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

struct RawCustomerRow {
    customer_id: String,
    first_name: String,
    last_name: String,
    email: Option<String>,
    phone_number: String,
    account_number: Option<String>,
    created_by: String,
    created_at: String,
}

impl RawCustomerRow {
    fn into_record(self) -> Result<CustomerRecord, StoreError> {
        Ok(CustomerRecord {
            customer_id: CustomerId(parse_ulid(&self.customer_id)?),
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone_number: self.phone_number,
            account_number: self.account_number,
            created_by: self.created_by,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn fatal_load(artifact_id: ArtifactId, table: &str, err: &StoreError) -> StoreError {
    StoreError::FatalRestore {
        summary: format!(
            "restore of snapshot {artifact_id} failed while loading {table} rows"
        ),
        issues: vec![IntegrityIssue {
            code: IssueCode::InvalidRow,
            table: table.to_string(),
            detail: err.to_string(),
        }],
    }
}

fn insert_customer_row(conn: &Connection, record: &CustomerRecord) -> Result<(), StoreError> {
    let phone_key = normalize_phone(&record.phone_number);
    if phone_key.is_empty() {
        return Err(StoreError::Validation(
            "phone_number MUST contain at least one digit".to_string(),
        ));
    }

    conn.execute(
        "INSERT INTO customers(
            customer_id, first_name, last_name, email, phone_number, phone_key,
            account_number, created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.customer_id.to_string(),
            record.first_name,
            record.last_name,
            record.email,
            record.phone_number,
            phone_key,
            record.account_number,
            record.created_by,
            rfc3339(record.created_at)?,
        ],
    )?;
    Ok(())
}

fn insert_sale_row(conn: &Connection, sale: &SaleRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sales(sale_id, customer_id, total_cost_cents, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            sale.sale_id.to_string(),
            sale.customer_id.to_string(),
            sale.total_cost_cents,
            sale.created_by,
            rfc3339(sale.created_at)?,
        ],
    )?;
    Ok(())
}

fn customer_exists(conn: &Connection, customer_id: CustomerId) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM customers WHERE customer_id = ?1)",
        params![customer_id.to_string()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn read_customers(conn: &Connection) -> Result<Vec<CustomerRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT customer_id, first_name, last_name, email, phone_number, account_number,
                created_by, created_at
         FROM customers
         ORDER BY created_at DESC, customer_id ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let raw = RawCustomerRow {
            customer_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            email: row.get(3)?,
            phone_number: row.get(4)?,
            account_number: row.get(5)?,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
        };
        records.push(raw.into_record()?);
    }

    Ok(records)
}

fn read_sales(conn: &Connection) -> Result<Vec<SaleRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT sale_id, customer_id, total_cost_cents, created_by, created_at
         FROM sales
         ORDER BY created_at DESC, sale_id ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut sales = Vec::new();
    while let Some(row) = rows.next()? {
        let sale_id_raw: String = row.get(0)?;
        let customer_id_raw: String = row.get(1)?;
        let created_at_raw: String = row.get(4)?;
        sales.push(SaleRecord {
            sale_id: SaleId(parse_ulid(&sale_id_raw)?),
            customer_id: CustomerId(parse_ulid(&customer_id_raw)?),
            total_cost_cents: row.get(2)?,
            created_by: row.get(3)?,
            created_at: parse_rfc3339(&created_at_raw)?,
        });
    }

    Ok(sales)
}

fn parse_artifact_document(document: &str, size_bytes: u64) -> Result<SnapshotArtifact, StoreError> {
    let mut artifact: SnapshotArtifact = serde_json::from_str(document).map_err(|err| {
        StoreError::Storage(format!("failed to deserialize stored snapshot artifact: {err}"))
    })?;
    artifact.metadata.size_bytes = Some(size_bytes);
    Ok(artifact)
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )?;
    Ok(())
}

fn now_rfc3339() -> Result<String, StoreError> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Storage(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Storage(format!("invalid RFC3339 timestamp {value}: {err}")))
}

fn parse_ulid(raw: &str) -> Result<Ulid, StoreError> {
    Ulid::from_string(raw).map_err(|err| StoreError::Storage(format!("invalid ULID {raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::{anyhow, Result};

    use super::*;
    use customer_ledger_core::customers_table_digest;

    fn mk_customer(first_name: &str, last_name: &str, email: Option<&str>, phone: &str) -> CustomerRecord {
        CustomerRecord {
            customer_id: CustomerId::new(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.map(str::to_string),
            phone_number: phone.to_string(),
            account_number: None,
            created_by: "tester".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn mk_sale(customer_id: CustomerId, total_cost_cents: i64) -> SaleRecord {
        SaleRecord {
            sale_id: SaleId::new(),
            customer_id,
            total_cost_cents,
            created_by: "tester".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn open_migrated() -> Result<LedgerStore> {
        let mut store = LedgerStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_is_idempotent_and_reports_schema_status() -> Result<()> {
        let mut store = LedgerStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = open_migrated()?;

        let check_result = store.conn.execute(
            "INSERT INTO sales(sale_id, customer_id, total_cost_cents, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                SaleId::new().to_string(),
                CustomerId::new().to_string(),
                -100_i64,
                "tester",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO sales(sale_id, customer_id, total_cost_cents, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                SaleId::new().to_string(),
                CustomerId::new().to_string(),
                100_i64,
                "tester",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(fk_result.is_err());

        Ok(())
    }

    #[test]
    fn insert_and_list_customers_round_trip() -> Result<()> {
        let mut store = open_migrated()?;

        let with_email =
            mk_customer("Margot", "Maitland", Some("margot@corp.net"), "07123456789");
        let without_email = mk_customer("Hugh", "Bonner", None, "07999999999");

        store.insert_customer(&with_email)?;
        store.insert_customer(&without_email)?;

        let listed = store.list_customers()?;
        assert_eq!(listed.len(), 2);

        let Some(loaded) =
            listed.iter().find(|record| record.customer_id == with_email.customer_id)
        else {
            return Err(anyhow!("inserted customer not found in listing"));
        };
        assert_eq!(loaded.email, Some("margot@corp.net".to_string()));
        assert_eq!(loaded.phone_number, "07123456789");

        let fetched = store.get_customer(without_email.customer_id)?;
        assert_eq!(fetched.map(|record| record.email), Some(None));

        Ok(())
    }

    #[test]
    fn duplicate_normalized_phone_is_rejected_at_insert() -> Result<()> {
        let mut store = open_migrated()?;

        let first = mk_customer("Margot", "Maitland", None, "07123456789");
        let second = mk_customer("Hugh", "Bonner", None, "+44 7123 456 789");

        store.insert_customer(&first)?;
        let err = match store.insert_customer(&second) {
            Ok(()) => return Err(anyhow!("expected duplicate phone rejection")),
            Err(err) => err,
        };

        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.list_customers()?.len(), 1);
        Ok(())
    }

    #[test]
    fn insert_customer_rejects_digitless_phone() -> Result<()> {
        let mut store = open_migrated()?;

        let record = mk_customer("Margot", "Maitland", None, "ext. office");
        let err = match store.insert_customer(&record) {
            Ok(()) => return Err(anyhow!("expected digitless phone rejection")),
            Err(err) => err,
        };

        assert!(matches!(err, StoreError::Validation(_)));
        Ok(())
    }

    #[test]
    fn insert_sale_requires_existing_customer() -> Result<()> {
        let mut store = open_migrated()?;

        let orphan = mk_sale(CustomerId::new(), 5_000);
        let err = match store.insert_sale(&orphan) {
            Ok(()) => return Err(anyhow!("expected missing-customer rejection")),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::NotFound(_)));

        let customer = mk_customer("Margot", "Maitland", None, "07123456789");
        store.insert_customer(&customer)?;
        store.insert_sale(&mk_sale(customer.customer_id, 5_000))?;
        assert_eq!(store.list_sales()?.len(), 1);

        Ok(())
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_table_digests() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let margot = mk_customer("Margot", "Maitland", Some("margot@corp.net"), "07123456789");
        let hugh = mk_customer("Hugh", "Bonner", None, "07999999999");
        store.insert_customer(&margot)?;
        store.insert_customer(&hugh)?;
        store.insert_sale(&mk_sale(margot.customer_id, 12_500))?;

        let artifact = store.create_snapshot("scheduled backup", "ops")?;
        assert!(artifact.metadata.size_bytes.is_some());

        // Post-snapshot drift that the restore must erase.
        let paula = mk_customer("Paula", "Vance", None, "07555555555");
        store.insert_customer(&paula)?;
        store.insert_sale(&mk_sale(paula.customer_id, 900))?;
        assert_eq!(store.list_customers()?.len(), 3);

        let report = store.restore_snapshot(
            artifact.artifact_id,
            &artifact.artifact_id.to_string(),
            "ops",
            &rules,
        )?;

        assert_eq!(report.artifact_id, artifact.artifact_id);
        assert_ne!(report.safety_artifact_id, artifact.artifact_id);
        assert_eq!(report.committed_counts.get(TABLE_CUSTOMERS), Some(&2));
        assert_eq!(report.committed_counts.get(TABLE_SALES), Some(&1));
        assert_eq!(
            report.phases,
            vec![
                RestorePhase::Requested,
                RestorePhase::Validated,
                RestorePhase::SafetySnapshot,
                RestorePhase::Cleared,
                RestorePhase::Loaded,
                RestorePhase::Verified,
                RestorePhase::Committed,
            ]
        );

        let live = store.list_customers()?;
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|record| record.customer_id != paula.customer_id));

        let live_digest = customers_table_digest(&live)?;
        let Some(stored_digest) = artifact
            .metadata
            .tables
            .iter()
            .find(|entry| entry.table == TABLE_CUSTOMERS)
        else {
            return Err(anyhow!("artifact is missing the customers digest"));
        };
        assert_eq!(live_digest, stored_digest.sha256);

        // The safety snapshot of the pre-restore state is retrievable.
        let summaries = store.list_snapshots()?;
        assert_eq!(summaries.len(), 2);
        assert!(summaries
            .iter()
            .any(|summary| summary.artifact_id == report.safety_artifact_id));

        Ok(())
    }

    #[test]
    fn restore_rejects_missing_or_wrong_confirmation_token() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let margot = mk_customer("Margot", "Maitland", None, "07123456789");
        store.insert_customer(&margot)?;
        let artifact = store.create_snapshot("scheduled backup", "ops")?;

        let paula = mk_customer("Paula", "Vance", None, "07555555555");
        store.insert_customer(&paula)?;

        for token in ["", "not-the-artifact-id"] {
            let err = match store.restore_snapshot(artifact.artifact_id, token, "ops", &rules) {
                Ok(report) => return Err(anyhow!("expected token rejection, got {report:?}")),
                Err(err) => err,
            };
            assert!(matches!(err, StoreError::Validation(_)));
        }

        // Nothing was cleared or snapshotted by the rejected attempts.
        assert_eq!(store.list_customers()?.len(), 2);
        assert_eq!(store.list_snapshots()?.len(), 1);
        Ok(())
    }

    #[test]
    fn restore_rejects_tampered_artifact_and_names_the_table() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let margot = mk_customer("Margot", "Maitland", Some("margot@corp.net"), "07123456789");
        store.insert_customer(&margot)?;
        let artifact = store.create_snapshot("scheduled backup", "ops")?;

        let Some(mut tampered) = store.get_snapshot(artifact.artifact_id)? else {
            return Err(anyhow!("stored artifact not found"));
        };
        tampered.tables.customers[0].email = Some("margot@c0rp.net".to_string());
        let document = serde_json::to_string(&tampered)?;
        store.conn.execute(
            "UPDATE snapshot_artifacts SET artifact_json = ?1 WHERE artifact_id = ?2",
            params![document, artifact.artifact_id.to_string()],
        )?;

        let issues = store.validate_snapshot(artifact.artifact_id, &rules)?;
        assert!(issues
            .iter()
            .any(|issue| issue.code == IssueCode::DigestMismatch && issue.table == TABLE_CUSTOMERS));

        let err = match store.restore_snapshot(
            artifact.artifact_id,
            &artifact.artifact_id.to_string(),
            "ops",
            &rules,
        ) {
            Ok(report) => return Err(anyhow!("expected integrity rejection, got {report:?}")),
            Err(err) => err,
        };
        let StoreError::Integrity { issues, .. } = err else {
            return Err(anyhow!("expected Integrity error, got {err}"));
        };
        assert!(issues.iter().any(|issue| issue.table == TABLE_CUSTOMERS));

        // The live row is untouched by the rejected restore.
        let live = store.list_customers()?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].email, Some("margot@corp.net".to_string()));
        Ok(())
    }

    #[test]
    fn unknown_format_version_is_rejected_without_hash_comparison() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let margot = mk_customer("Margot", "Maitland", None, "07123456789");
        store.insert_customer(&margot)?;
        let artifact = store.create_snapshot("scheduled backup", "ops")?;

        let Some(mut tampered) = store.get_snapshot(artifact.artifact_id)? else {
            return Err(anyhow!("stored artifact not found"));
        };
        tampered.format_version = 99;
        tampered.tables.customers[0].first_name = "Altered".to_string();
        let document = serde_json::to_string(&tampered)?;
        store.conn.execute(
            "UPDATE snapshot_artifacts SET artifact_json = ?1 WHERE artifact_id = ?2",
            params![document, artifact.artifact_id.to_string()],
        )?;

        let issues = store.validate_snapshot(artifact.artifact_id, &rules)?;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, IssueCode::UnsupportedFormatVersion);
        Ok(())
    }

    #[test]
    fn placeholder_email_blocks_restore_even_with_matching_digests() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let suspect =
            mk_customer("Margot", "Maitland", Some("margot@placeholder.com"), "07123456789");
        store.insert_customer(&suspect)?;
        let artifact = store.create_snapshot("scheduled backup", "ops")?;

        let issues = store.validate_snapshot(artifact.artifact_id, &rules)?;
        assert!(issues.iter().any(|issue| issue.code == IssueCode::PlaceholderEmail));
        assert!(!issues.iter().any(|issue| issue.code == IssueCode::DigestMismatch));

        let err = match store.restore_snapshot(
            artifact.artifact_id,
            &artifact.artifact_id.to_string(),
            "ops",
            &rules,
        ) {
            Ok(report) => return Err(anyhow!("expected legitimacy rejection, got {report:?}")),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Integrity { .. }));
        Ok(())
    }

    #[test]
    fn restore_rolls_back_when_artifact_collides_on_phone_key() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let live = mk_customer("Margot", "Maitland", None, "07999999999");
        store.insert_customer(&live)?;

        // Two artifact rows normalize to the same phone key, which only the
        // live UNIQUE index can detect, mid-load.
        let colliding = SnapshotArtifact::build(
            vec![
                mk_customer("Hugh", "Bonner", None, "07123456789"),
                mk_customer("Paula", "Vance", None, "+44 7123 456 789"),
            ],
            Vec::new(),
            "offsite artifact",
            "ops",
            OffsetDateTime::now_utc(),
        )?;
        store.import_artifact(&colliding, &rules)?;

        let err = match store.restore_snapshot(
            colliding.artifact_id,
            &colliding.artifact_id.to_string(),
            "ops",
            &rules,
        ) {
            Ok(report) => return Err(anyhow!("expected mid-load failure, got {report:?}")),
            Err(err) => err,
        };
        let StoreError::FatalRestore { issues, .. } = err else {
            return Err(anyhow!("expected FatalRestore error, got {err}"));
        };
        assert!(issues.iter().any(|issue| issue.table == TABLE_CUSTOMERS));

        // Full rollback: the pre-restore row is still the only live customer.
        let after = store.list_customers()?;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].customer_id, live.customer_id);
        Ok(())
    }

    #[test]
    fn import_artifact_validates_fail_closed_and_rejects_duplicates() -> Result<()> {
        let mut store = open_migrated()?;
        let rules = LegitimacyRules::default();

        let clean = SnapshotArtifact::build(
            vec![mk_customer("Margot", "Maitland", None, "07123456789")],
            Vec::new(),
            "offsite artifact",
            "ops",
            OffsetDateTime::now_utc(),
        )?;

        let summary = store.import_artifact(&clean, &rules)?;
        assert_eq!(summary.artifact_id, clean.artifact_id);

        let err = match store.import_artifact(&clean, &rules) {
            Ok(summary) => return Err(anyhow!("expected duplicate rejection, got {summary:?}")),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Duplicate(_)));

        let mut tampered = clean.clone();
        tampered.artifact_id = ArtifactId::new();
        tampered.tables.customers[0].last_name = "Altered".to_string();
        let err = match store.import_artifact(&tampered, &rules) {
            Ok(summary) => return Err(anyhow!("expected integrity rejection, got {summary:?}")),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Integrity { .. }));

        Ok(())
    }

    #[test]
    fn backup_database_copy_is_openable() -> Result<()> {
        let mut source = open_migrated()?;
        let margot = mk_customer("Margot", "Maitland", None, "07123456789");
        source.insert_customer(&margot)?;

        let backup_file =
            std::env::temp_dir().join(format!("customer-ledger-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let copy = LedgerStore::open(&backup_file)?;
        let records = copy.list_customers()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].customer_id, margot.customer_id);

        fs::remove_file(&backup_file)
            .map_err(|err| anyhow!("failed to cleanup backup file: {err}"))?;
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = open_migrated()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        Ok(())
    }

    #[test]
    fn concurrent_writes_and_reads_preserve_integrity() -> Result<()> {
        let db_path = std::env::temp_dir()
            .join(format!("customer-ledger-concurrency-{}.sqlite3", Ulid::new()));
        {
            let mut init = LedgerStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 4_usize;
        let writes_per_thread = 20_usize;
        let reader_threads = 2_usize;
        let read_iterations = 30_usize;

        let mut handles = Vec::new();

        for thread_index in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = LedgerStore::open(&writer_path)?;
                store.migrate()?;
                for write_index in 0..writes_per_thread {
                    let record = CustomerRecord {
                        customer_id: CustomerId::new(),
                        first_name: format!("First{thread_index}x{write_index}"),
                        last_name: format!("Last{thread_index}x{write_index}"),
                        email: None,
                        phone_number: format!("07{thread_index}{write_index:08}"),
                        account_number: None,
                        created_by: "thread-writer".to_string(),
                        created_at: OffsetDateTime::now_utc(),
                    };
                    store.insert_customer(&record)?;
                }
                Ok(())
            }));
        }

        for _ in 0..reader_threads {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = LedgerStore::open(&reader_path)?;
                for _ in 0..read_iterations {
                    let _ = store.list_customers()?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = LedgerStore::open(&db_path)?;
        let records = store.list_customers()?;
        assert_eq!(records.len(), writer_threads * writes_per_thread);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|err| anyhow!("failed to cleanup sqlite file: {err}"))?;
            }
        }

        Ok(())
    }
}
