use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use customer_ledger_core::{
    classify_candidate, filter_customers, ArtifactId, ConfidenceTier, CustomerId, CustomerRecord,
    DuplicateCheckPolicy, ExcludedCustomer, ExclusionIndex, IntakeCandidate, IntegrityIssue,
    LegitimacyRules, MatchResult, RestoreReport, SaleId, SaleRecord, SnapshotArtifact,
    SnapshotSummary,
};
use customer_ledger_store_sqlite::{LedgerStore, SchemaStatus, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntakeCheckRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCustomerRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: String,
    pub account_number: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// Outcome of a guarded insert. `duplicate_check` is `None` only when the
/// advisory check could not run and the configured policy allowed the insert
/// to proceed anyway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCustomerOutcome {
    pub customer: CustomerRecord,
    pub duplicate_check: Option<MatchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddSaleRequest {
    pub customer_id: CustomerId,
    pub total_cost_cents: i64,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFilterRequest {
    pub exclusion_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFilterResult {
    pub kept: Vec<CustomerRecord>,
    pub excluded: Vec<ExcludedCustomer>,
    pub exclusion_key_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotValidation {
    pub artifact_id: ArtifactId,
    pub valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSnapshotRequest {
    pub artifact_id: ArtifactId,
    pub confirmation_token: String,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct CustomerLedgerApi {
    db_path: PathBuf,
    policy: DuplicateCheckPolicy,
    rules: LegitimacyRules,
}

impl CustomerLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            policy: DuplicateCheckPolicy::default(),
            rules: LegitimacyRules::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: DuplicateCheckPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: LegitimacyRules) -> Self {
        self.rules = rules;
        self
    }

    fn open_store(&self) -> Result<LedgerStore, StoreError> {
        LedgerStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the advisory duplicate check for one intake candidate without
    /// writing anything. Store errors always propagate here; the configured
    /// policy only gates the guarded insert.
    ///
    /// # Errors
    /// Returns an error when the candidate is invalid or the store cannot be
    /// read.
    pub fn check_intake(&self, input: IntakeCheckRequest) -> Result<MatchResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let candidate = IntakeCandidate {
            first_name: input.first_name,
            last_name: input.last_name,
            email: input.email,
            phone_number: input.phone_number,
        };
        let existing = store.list_customers()?;
        Ok(classify_candidate(&candidate, &existing).map_err(StoreError::from)?)
    }

    /// Insert one customer behind the duplicate guard.
    ///
    /// HIGH and MEDIUM confidence matches block the insert with
    /// [`StoreError::Duplicate`]; LOW matches and no-matches proceed and the
    /// advisory result rides along in the outcome. When the advisory read
    /// fails, `fail_closed` rejects the insert and `fail_open` proceeds with
    /// `duplicate_check: None`. The stored phone-key uniqueness constraint
    /// still backstops either policy.
    ///
    /// # Errors
    /// Returns an error when validation fails, a blocking duplicate is found,
    /// or persistence fails.
    pub fn add_customer(&self, input: AddCustomerRequest) -> Result<AddCustomerOutcome> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let record = build_customer_record(input);
        record.validate().map_err(StoreError::from)?;

        let duplicate_check = match store.list_customers() {
            Ok(existing) => {
                let candidate = IntakeCandidate {
                    first_name: record.first_name.clone(),
                    last_name: record.last_name.clone(),
                    email: record.email.clone(),
                    phone_number: record.phone_number.clone(),
                };
                let result =
                    classify_candidate(&candidate, &existing).map_err(StoreError::from)?;
                if matches!(
                    result.confidence,
                    Some(ConfidenceTier::High | ConfidenceTier::Medium)
                ) {
                    return Err(StoreError::Duplicate(result.reason).into());
                }
                Some(result)
            }
            Err(err) => match self.policy {
                DuplicateCheckPolicy::FailClosed => return Err(err.into()),
                DuplicateCheckPolicy::FailOpen => None,
            },
        };

        store.insert_customer(&record)?;
        Ok(AddCustomerOutcome { customer: record, duplicate_check })
    }

    /// List all customers, newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_customers(&self) -> Result<Vec<CustomerRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store.list_customers()?)
    }

    /// Record one sale against an existing customer.
    ///
    /// # Errors
    /// Returns an error when the customer does not exist, the sale is
    /// invalid, or persistence fails.
    pub fn add_sale(&self, input: AddSaleRequest) -> Result<SaleRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let sale = SaleRecord {
            sale_id: SaleId::new(),
            customer_id: input.customer_id,
            total_cost_cents: input.total_cost_cents,
            created_by: input.created_by,
            created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.insert_sale(&sale)?;
        Ok(sale)
    }

    /// List all sales, newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_sales(&self) -> Result<Vec<SaleRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store.list_sales()?)
    }

    /// Partition the full customer set against a raw exclusion list.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or a stored record is
    /// invalid.
    pub fn filter_export(&self, input: ExportFilterRequest) -> Result<ExportFilterResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let index = ExclusionIndex::build(&input.exclusion_lines);
        let records = store.list_customers()?;
        let outcome = filter_customers(&records, &index).map_err(StoreError::from)?;

        Ok(ExportFilterResult {
            kept: outcome.kept,
            excluded: outcome.excluded,
            exclusion_key_counts: index.key_counts(),
        })
    }

    /// Capture a new snapshot artifact of both critical tables.
    ///
    /// # Errors
    /// Returns an error when the capture or persistence fails.
    pub fn create_snapshot(&self, input: CreateSnapshotRequest) -> Result<SnapshotArtifact> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let artifact = store.create_snapshot(&input.reason, &input.actor)?;
        Ok(artifact)
    }

    /// List stored snapshot summaries, newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store.list_snapshots()?)
    }

    /// Fetch one stored snapshot artifact in full.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the artifact is absent, and other
    /// errors when the store cannot be read.
    pub fn snapshot_show(&self, artifact_id: ArtifactId) -> Result<SnapshotArtifact> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let artifact = store.get_snapshot(artifact_id)?.ok_or_else(|| {
            StoreError::NotFound(format!("snapshot artifact {artifact_id} not found"))
        })?;
        Ok(artifact)
    }

    /// Run the full fail-closed validation of one stored artifact.
    ///
    /// # Errors
    /// Returns an error when the artifact is absent or cannot be decoded;
    /// integrity findings come back in the result, not as errors.
    pub fn validate_snapshot(&self, artifact_id: ArtifactId) -> Result<SnapshotValidation> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let issues = store.validate_snapshot(artifact_id, &self.rules)?;
        Ok(SnapshotValidation { artifact_id, valid: issues.is_empty(), issues })
    }

    /// Replace the live tables from a stored artifact, token-gated.
    ///
    /// # Errors
    /// Returns an error when the token does not match, validation finds
    /// issues, or the restore transaction fails and rolls back.
    pub fn restore_snapshot(&self, input: RestoreSnapshotRequest) -> Result<RestoreReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let report = store.restore_snapshot(
            input.artifact_id,
            &input.confirmation_token,
            &input.actor,
            &self.rules,
        )?;
        Ok(report)
    }

    /// Store an externally produced artifact after full re-validation.
    ///
    /// # Errors
    /// Returns an error when validation finds issues, the artifact id is
    /// already stored, or persistence fails.
    pub fn import_snapshot(&self, artifact: &SnapshotArtifact) -> Result<SnapshotSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let summary = store.import_artifact(artifact, &self.rules)?;
        Ok(summary)
    }
}

fn build_customer_record(input: AddCustomerRequest) -> CustomerRecord {
    CustomerRecord {
        customer_id: CustomerId::new(),
        first_name: input.first_name,
        last_name: input.last_name,
        email: input.email,
        phone_number: input.phone_number,
        account_number: input.account_number,
        created_by: input.created_by,
        created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
    }
}
