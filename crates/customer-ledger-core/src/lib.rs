use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CustomerId(pub Ulid);

impl CustomerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CustomerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CustomerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SaleId(pub Ulid);

impl SaleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SaleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SaleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArtifactId(pub Ulid);

impl ArtifactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCheckPolicy {
    #[default]
    FailClosed,
    FailOpen,
}

impl DuplicateCheckPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailClosed => "fail_closed",
            Self::FailOpen => "fail_open",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fail_closed" => Some(Self::FailClosed),
            "fail_open" => Some(Self::FailOpen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CustomerRecord {
    pub customer_id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: String,
    pub account_number: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CustomerRecord {
    /// Validate the identity and provenance fields of one customer row.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a required field is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.first_name.trim().is_empty() {
            return Err(LedgerError::Validation("first_name MUST be provided".to_string()));
        }

        if self.last_name.trim().is_empty() {
            return Err(LedgerError::Validation("last_name MUST be provided".to_string()));
        }

        if self.phone_number.trim().is_empty() {
            return Err(LedgerError::Validation("phone_number MUST be provided".to_string()));
        }

        if self.created_by.trim().is_empty() {
            return Err(LedgerError::Validation(
                "created_by MUST be provided for every write".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SaleRecord {
    pub sale_id: SaleId,
    pub customer_id: CustomerId,
    pub total_cost_cents: i64,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SaleRecord {
    /// Validate one sale row.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the amount is negative or
    /// provenance is missing.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.total_cost_cents < 0 {
            return Err(LedgerError::Validation(
                "total_cost_cents MUST NOT be negative".to_string(),
            ));
        }

        if self.created_by.trim().is_empty() {
            return Err(LedgerError::Validation(
                "created_by MUST be provided for every write".to_string(),
            ));
        }

        Ok(())
    }
}

/// Intake-side shape of a customer before an id or provenance is assigned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntakeCandidate {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: String,
}

impl IntakeCandidate {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a required field is blank.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.first_name.trim().is_empty() {
            return Err(LedgerError::Validation("first_name MUST be provided".to_string()));
        }

        if self.last_name.trim().is_empty() {
            return Err(LedgerError::Validation("last_name MUST be provided".to_string()));
        }

        if self.phone_number.trim().is_empty() {
            return Err(LedgerError::Validation("phone_number MUST be provided".to_string()));
        }

        Ok(())
    }
}

/// Canonical comparison form of a phone number: digits only, truncated to the
/// trailing 10 so international dial prefixes and country codes drop away.
/// Applying the function to its own output returns the same value.
#[must_use]
pub fn normalize_phone(input: &str) -> String {
    let digits = input.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.len() > 10 {
        digits[digits.len() - 10..].to_string()
    } else {
        digits
    }
}

/// Trailing-8 comparison suffix, present when the input carries at least 8
/// digits. Tolerates residual leading-zero/country-code variance that the
/// primary key cannot.
#[must_use]
pub fn phone_suffix(input: &str) -> Option<String> {
    let digits = input.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.len() >= 8 {
        Some(digits[digits.len() - 8..].to_string())
    } else {
        None
    }
}

/// Lower-cased, trimmed email key; blank input yields no key at all so an
/// absent email can never match an empty string.
#[must_use]
pub fn normalize_email(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Lower-cased name component with internal whitespace collapsed.
#[must_use]
pub fn normalize_name_part(input: &str) -> String {
    input.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Derived comparison keys for one customer. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedKey {
    pub email_key: Option<String>,
    pub phone_key: String,
    pub phone_suffix_key: Option<String>,
    pub account_key: Option<String>,
    pub name_key: String,
    pub reversed_name_key: String,
    pub first_name_key: String,
    pub last_name_key: String,
}

impl NormalizedKey {
    #[must_use]
    pub fn from_parts(
        first_name: &str,
        last_name: &str,
        email: Option<&str>,
        phone_number: &str,
        account_number: Option<&str>,
    ) -> Self {
        let first_name_key = normalize_name_part(first_name);
        let last_name_key = normalize_name_part(last_name);
        Self {
            email_key: email.and_then(normalize_email),
            phone_key: normalize_phone(phone_number),
            phone_suffix_key: phone_suffix(phone_number),
            account_key: account_number.and_then(|value| {
                let digits = value.chars().filter(char::is_ascii_digit).collect::<String>();
                if digits.is_empty() {
                    None
                } else {
                    Some(digits)
                }
            }),
            name_key: format!("{first_name_key} {last_name_key}"),
            reversed_name_key: format!("{last_name_key} {first_name_key}"),
            first_name_key,
            last_name_key,
        }
    }

    #[must_use]
    pub fn for_record(record: &CustomerRecord) -> Self {
        Self::from_parts(
            &record.first_name,
            &record.last_name,
            record.email.as_deref(),
            &record.phone_number,
            record.account_number.as_deref(),
        )
    }

    #[must_use]
    pub fn for_candidate(candidate: &IntakeCandidate) -> Self {
        Self::from_parts(
            &candidate.first_name,
            &candidate.last_name,
            candidate.email.as_deref(),
            &candidate.phone_number,
            None,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchResult {
    pub is_duplicate: bool,
    pub matched_customer_id: Option<CustomerId>,
    pub confidence: Option<ConfidenceTier>,
    pub reason: String,
}

impl MatchResult {
    #[must_use]
    pub fn no_match() -> Self {
        Self {
            is_duplicate: false,
            matched_customer_id: None,
            confidence: None,
            reason: "no duplicate signals matched".to_string(),
        }
    }

    fn duplicate(record: &CustomerRecord, confidence: ConfidenceTier, reason: &str) -> Self {
        Self {
            is_duplicate: true,
            matched_customer_id: Some(record.customer_id),
            confidence: Some(confidence),
            reason: reason.to_string(),
        }
    }
}

struct KeyedRecord<'a> {
    record: &'a CustomerRecord,
    keys: NormalizedKey,
}

fn phones_match(lhs: &NormalizedKey, rhs: &NormalizedKey) -> bool {
    if !lhs.phone_key.is_empty() && lhs.phone_key == rhs.phone_key {
        return true;
    }

    matches!(
        (&lhs.phone_suffix_key, &rhs.phone_suffix_key),
        (Some(left), Some(right)) if left == right
    )
}

fn emails_match(lhs: &NormalizedKey, rhs: &NormalizedKey) -> bool {
    matches!(
        (&lhs.email_key, &rhs.email_key),
        (Some(left), Some(right)) if left == right
    )
}

fn names_contain(lhs: &NormalizedKey, rhs: &NormalizedKey) -> bool {
    let overlaps = |left: &str, right: &str| {
        !left.is_empty() && !right.is_empty() && (left.contains(right) || right.contains(left))
    };
    overlaps(&lhs.first_name_key, &rhs.first_name_key)
        && overlaps(&lhs.last_name_key, &rhs.last_name_key)
}

/// Classify one intake candidate against the existing customer set.
///
/// Rules run in strict priority order and the first one that fires wins;
/// within a rule the record with the smallest id is reported so the result is
/// independent of the order the store returned rows in. The function is a
/// pure read and never mutates its inputs.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the candidate or any existing
/// record is missing required fields.
pub fn classify_candidate(
    candidate: &IntakeCandidate,
    records: &[CustomerRecord],
) -> Result<MatchResult, LedgerError> {
    candidate.validate()?;
    for record in records {
        record.validate()?;
    }

    let candidate_keys = NormalizedKey::for_candidate(candidate);
    let mut keyed = records
        .iter()
        .map(|record| KeyedRecord { record, keys: NormalizedKey::for_record(record) })
        .collect::<Vec<_>>();
    keyed.sort_by(|lhs, rhs| lhs.record.customer_id.cmp(&rhs.record.customer_id));

    if let Some(hit) = keyed.iter().find(|entry| {
        phones_match(&entry.keys, &candidate_keys) && entry.keys.name_key == candidate_keys.name_key
    }) {
        return Ok(MatchResult::duplicate(
            hit.record,
            ConfidenceTier::High,
            "exact match: phone and name",
        ));
    }

    if let Some(hit) = keyed.iter().find(|entry| phones_match(&entry.keys, &candidate_keys)) {
        return Ok(MatchResult::duplicate(
            hit.record,
            ConfidenceTier::Medium,
            "phone registered to a different customer",
        ));
    }

    if candidate_keys.email_key.is_some() {
        if let Some(hit) = keyed.iter().find(|entry| {
            emails_match(&entry.keys, &candidate_keys)
                && entry.keys.name_key == candidate_keys.name_key
        }) {
            return Ok(MatchResult::duplicate(
                hit.record,
                ConfidenceTier::High,
                "exact match: email and name",
            ));
        }

        if let Some(hit) = keyed.iter().find(|entry| emails_match(&entry.keys, &candidate_keys)) {
            return Ok(MatchResult::duplicate(
                hit.record,
                ConfidenceTier::Medium,
                "email registered to a different customer",
            ));
        }
    }

    if let Some(hit) = keyed.iter().find(|entry| entry.keys.name_key == candidate_keys.name_key) {
        return Ok(MatchResult::duplicate(
            hit.record,
            ConfidenceTier::Low,
            "name match without phone or email corroboration",
        ));
    }

    if let Some(hit) = keyed.iter().find(|entry| names_contain(&entry.keys, &candidate_keys)) {
        return Ok(MatchResult::duplicate(
            hit.record,
            ConfidenceTier::Low,
            "partial name match on first and last name",
        ));
    }

    Ok(MatchResult::no_match())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionKeyKind {
    Email,
    Phone,
    PhonePartial,
    Account,
    FullName,
    ReversedName,
    SingleName,
}

impl ExclusionKeyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::PhonePartial => "phone_partial",
            Self::Account => "account",
            Self::FullName => "full_name",
            Self::ReversedName => "reversed_name",
            Self::SingleName => "single_name",
        }
    }
}

/// Typed key sets built once from a free-text exclusion list so that bulk
/// filtering is a set lookup per candidate instead of a scan per pair.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ExclusionIndex {
    emails: HashSet<String>,
    phones: HashSet<String>,
    phone_partials: HashSet<String>,
    accounts: HashSet<String>,
    full_names: HashSet<String>,
    single_names: HashSet<String>,
}

fn is_phone_like(value: &str) -> bool {
    let digit_count = value.chars().filter(char::is_ascii_digit).count();
    digit_count >= 6
        && value.chars().all(|ch| {
            ch.is_ascii_digit()
                || ch.is_ascii_whitespace()
                || matches!(ch, '+' | '-' | '(' | ')' | '.' | '/')
        })
}

fn is_bare_account_token(value: &str) -> bool {
    (8..=12).contains(&value.len()) && value.chars().all(|ch| ch.is_ascii_digit())
}

impl ExclusionIndex {
    /// Classify each list line into one or more typed keys. Classification is
    /// heuristic: `@` marks an email, a separator-tolerant run of 6+ digits a
    /// phone, a bare 8-12 digit token additionally an account number, and
    /// anything else a name (straight, swapped, and single-token forms).
    #[must_use]
    pub fn build(lines: &[String]) -> Self {
        let mut index = Self::default();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.contains('@') {
                if let Some(email) = normalize_email(trimmed) {
                    index.emails.insert(email);
                }
                continue;
            }

            if is_phone_like(trimmed) {
                let phone_key = normalize_phone(trimmed);
                if !phone_key.is_empty() {
                    index.phones.insert(phone_key);
                }
                if let Some(suffix) = phone_suffix(trimmed) {
                    index.phone_partials.insert(suffix);
                }
                if is_bare_account_token(trimmed) {
                    index.accounts.insert(trimmed.to_string());
                }
                continue;
            }

            index.register_name(trimmed);
        }
        index
    }

    fn register_name(&mut self, line: &str) {
        if let Some((left, right)) = line.split_once(',') {
            let left_key = normalize_name_part(left);
            let right_key = normalize_name_part(right);
            match (left_key.is_empty(), right_key.is_empty()) {
                (false, false) => {
                    // "Last, First" reads as first+last once swapped.
                    self.full_names.insert(format!("{right_key} {left_key}"));
                    self.full_names.insert(format!("{left_key} {right_key}"));
                }
                (false, true) => {
                    self.register_name_tokens(&left_key);
                }
                (true, false) => {
                    self.register_name_tokens(&right_key);
                }
                (true, true) => {}
            }
            return;
        }

        let key = normalize_name_part(line);
        if !key.is_empty() {
            self.register_name_tokens(&key);
        }
    }

    fn register_name_tokens(&mut self, key: &str) {
        let tokens = key.split(' ').collect::<Vec<_>>();
        if tokens.len() == 1 {
            self.single_names.insert(key.to_string());
            return;
        }

        self.full_names.insert(key.to_string());
        let mut reversed = tokens;
        reversed.reverse();
        self.full_names.insert(reversed.join(" "));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
            && self.phones.is_empty()
            && self.phone_partials.is_empty()
            && self.accounts.is_empty()
            && self.full_names.is_empty()
            && self.single_names.is_empty()
    }

    /// Per-set key counts for audit output.
    #[must_use]
    pub fn key_counts(&self) -> BTreeMap<String, usize> {
        BTreeMap::from([
            ("emails".to_string(), self.emails.len()),
            ("phones".to_string(), self.phones.len()),
            ("phone_partials".to_string(), self.phone_partials.len()),
            ("accounts".to_string(), self.accounts.len()),
            ("full_names".to_string(), self.full_names.len()),
            ("single_names".to_string(), self.single_names.len()),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExcludedCustomer {
    pub record: CustomerRecord,
    pub matched_kinds: Vec<ExclusionKeyKind>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FilterOutcome {
    pub kept: Vec<CustomerRecord>,
    pub excluded: Vec<ExcludedCustomer>,
}

/// Partition a candidate set against a prepared exclusion index.
///
/// A candidate is excluded when any of its normalized keys hits any set; the
/// per-record trace names every kind that matched. Both partitions come back
/// sorted by customer id, so the outcome is identical for any permutation of
/// the inputs.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when a candidate record is missing
/// required fields.
pub fn filter_customers(
    records: &[CustomerRecord],
    index: &ExclusionIndex,
) -> Result<FilterOutcome, LedgerError> {
    for record in records {
        record.validate()?;
    }

    let mut kept: Vec<CustomerRecord> = Vec::new();
    let mut excluded: Vec<ExcludedCustomer> = Vec::new();

    for record in records {
        let keys = NormalizedKey::for_record(record);
        let mut matched_kinds: Vec<ExclusionKeyKind> = Vec::new();
        let mut reasons: Vec<String> = Vec::new();

        if let Some(email_key) = &keys.email_key {
            if index.emails.contains(email_key) {
                matched_kinds.push(ExclusionKeyKind::Email);
                reasons.push("email matches an exclusion entry".to_string());
            }
        }

        if !keys.phone_key.is_empty() && index.phones.contains(&keys.phone_key) {
            matched_kinds.push(ExclusionKeyKind::Phone);
            reasons.push("phone matches an exclusion entry".to_string());
        }

        if let Some(suffix) = &keys.phone_suffix_key {
            if index.phone_partials.contains(suffix) {
                matched_kinds.push(ExclusionKeyKind::PhonePartial);
                reasons.push("trailing phone digits match an exclusion entry".to_string());
            }
        }

        if let Some(account_key) = &keys.account_key {
            if index.accounts.contains(account_key) {
                matched_kinds.push(ExclusionKeyKind::Account);
                reasons.push("account number matches an exclusion entry".to_string());
            }
        }

        if index.full_names.contains(&keys.name_key) {
            matched_kinds.push(ExclusionKeyKind::FullName);
            reasons.push("full name matches an exclusion entry".to_string());
        } else if index.full_names.contains(&keys.reversed_name_key) {
            matched_kinds.push(ExclusionKeyKind::ReversedName);
            reasons.push("reversed full name matches an exclusion entry".to_string());
        }

        if index.single_names.contains(&keys.first_name_key) {
            matched_kinds.push(ExclusionKeyKind::SingleName);
            reasons.push("single-name exclusion entry matches first_name".to_string());
        }
        if keys.last_name_key != keys.first_name_key
            && index.single_names.contains(&keys.last_name_key)
        {
            matched_kinds.push(ExclusionKeyKind::SingleName);
            reasons.push("single-name exclusion entry matches last_name".to_string());
        }

        if matched_kinds.is_empty() {
            kept.push(record.clone());
        } else {
            excluded.push(ExcludedCustomer { record: record.clone(), matched_kinds, reasons });
        }
    }

    kept.sort_by(|lhs, rhs| lhs.customer_id.cmp(&rhs.customer_id));
    excluded.sort_by(|lhs, rhs| lhs.record.customer_id.cmp(&rhs.record.customer_id));

    Ok(FilterOutcome { kept, excluded })
}

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const TABLE_CUSTOMERS: &str = "customers";
pub const TABLE_SALES: &str = "sales";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDigest {
    pub table: String,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotTables {
    pub customers: Vec<CustomerRecord>,
    pub sales: Vec<SaleRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotMetadata {
    pub reason: String,
    pub actor: String,
    pub size_bytes: Option<u64>,
    pub tables: Vec<TableDigest>,
}

/// Immutable backup document: full table rows plus the per-table digests the
/// Validator later holds them against.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotArtifact {
    pub artifact_id: ArtifactId,
    pub format_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub tables: SnapshotTables,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotSummary {
    pub artifact_id: ArtifactId,
    pub format_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub reason: String,
    pub actor: String,
    pub size_bytes: Option<u64>,
    pub tables: Vec<TableDigest>,
}

impl SnapshotArtifact {
    /// Assemble a new artifact from captured rows, sorting each table by
    /// primary key and computing its digest.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when reason/actor are blank or a
    /// captured row is invalid, and [`LedgerError::Serialization`] when a row
    /// cannot be canonically serialized.
    pub fn build(
        mut customers: Vec<CustomerRecord>,
        mut sales: Vec<SaleRecord>,
        reason: &str,
        actor: &str,
        created_at: OffsetDateTime,
    ) -> Result<Self, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "reason MUST be provided for every snapshot".to_string(),
            ));
        }

        if actor.trim().is_empty() {
            return Err(LedgerError::Validation(
                "actor MUST be provided for every snapshot".to_string(),
            ));
        }

        for record in &customers {
            record.validate()?;
        }
        for sale in &sales {
            sale.validate()?;
        }

        customers.sort_by(|lhs, rhs| lhs.customer_id.cmp(&rhs.customer_id));
        sales.sort_by(|lhs, rhs| lhs.sale_id.cmp(&rhs.sale_id));

        let tables = vec![
            TableDigest {
                table: TABLE_CUSTOMERS.to_string(),
                sha256: customers_table_digest(&customers)?,
                rows: customers.len(),
            },
            TableDigest {
                table: TABLE_SALES.to_string(),
                sha256: sales_table_digest(&sales)?,
                rows: sales.len(),
            },
        ];

        Ok(Self {
            artifact_id: ArtifactId::new(),
            format_version: ARTIFACT_FORMAT_VERSION,
            created_at,
            tables: SnapshotTables { customers, sales },
            metadata: SnapshotMetadata {
                reason: reason.to_string(),
                actor: actor.to_string(),
                size_bytes: None,
                tables,
            },
        })
    }

    #[must_use]
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            artifact_id: self.artifact_id,
            format_version: self.format_version,
            created_at: self.created_at,
            reason: self.metadata.reason.clone(),
            actor: self.metadata.actor.clone(),
            size_bytes: self.metadata.size_bytes,
            tables: self.metadata.tables.clone(),
        }
    }
}

#[derive(Serialize)]
struct CustomerDigestRow<'a> {
    customer_id: &'a CustomerId,
    first_name: &'a str,
    last_name: &'a str,
    email: Option<&'a str>,
    phone_number: &'a str,
    account_number: Option<&'a str>,
}

#[derive(Serialize)]
struct SaleDigestRow<'a> {
    sale_id: &'a SaleId,
    customer_id: &'a CustomerId,
    total_cost_cents: i64,
}

fn digest_of_lines(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over the canonical serialization of the customer identity subset,
/// rows sorted by primary key. Provenance fields (`created_at`, `created_by`)
/// are not part of the digest.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when a row cannot be serialized.
pub fn customers_table_digest(rows: &[CustomerRecord]) -> Result<String, LedgerError> {
    let mut sorted = rows.iter().collect::<Vec<_>>();
    sorted.sort_by(|lhs, rhs| lhs.customer_id.cmp(&rhs.customer_id));

    let mut lines = Vec::with_capacity(sorted.len());
    for record in sorted {
        let row = CustomerDigestRow {
            customer_id: &record.customer_id,
            first_name: &record.first_name,
            last_name: &record.last_name,
            email: record.email.as_deref(),
            phone_number: &record.phone_number,
            account_number: record.account_number.as_deref(),
        };
        let line = serde_json::to_string(&row)
            .map_err(|err| LedgerError::Serialization(format!("customer digest row: {err}")))?;
        lines.push(line);
    }
    Ok(digest_of_lines(&lines))
}

/// SHA-256 over the canonical serialization of the sale subset, rows sorted
/// by primary key.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when a row cannot be serialized.
pub fn sales_table_digest(rows: &[SaleRecord]) -> Result<String, LedgerError> {
    let mut sorted = rows.iter().collect::<Vec<_>>();
    sorted.sort_by(|lhs, rhs| lhs.sale_id.cmp(&rhs.sale_id));

    let mut lines = Vec::with_capacity(sorted.len());
    for sale in sorted {
        let row = SaleDigestRow {
            sale_id: &sale.sale_id,
            customer_id: &sale.customer_id,
            total_cost_cents: sale.total_cost_cents,
        };
        let line = serde_json::to_string(&row)
            .map_err(|err| LedgerError::Serialization(format!("sale digest row: {err}")))?;
        lines.push(line);
    }
    Ok(digest_of_lines(&lines))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    UnsupportedFormatVersion,
    DigestMismatch,
    MissingDigest,
    RowCountMismatch,
    InvalidRow,
    PlaceholderEmail,
    DegeneratePhone,
    SuspiciousName,
    OrphanSale,
}

impl IssueCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedFormatVersion => "unsupported_format_version",
            Self::DigestMismatch => "digest_mismatch",
            Self::MissingDigest => "missing_digest",
            Self::RowCountMismatch => "row_count_mismatch",
            Self::InvalidRow => "invalid_row",
            Self::PlaceholderEmail => "placeholder_email",
            Self::DegeneratePhone => "degenerate_phone",
            Self::SuspiciousName => "suspicious_name",
            Self::OrphanSale => "orphan_sale",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityIssue {
    pub code: IssueCode,
    pub table: String,
    pub detail: String,
}

impl Display for IntegrityIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.code.as_str(), self.table, self.detail)
    }
}

/// Content-legitimacy rule set. Explicitly configured rather than hard-coded
/// so product owners can tune it; name matching is whole-token to avoid
/// flagging legitimately named customers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LegitimacyRules {
    pub placeholder_email_domains: Vec<String>,
    pub fake_phone_sequences: Vec<String>,
    pub suspicious_name_tokens: Vec<String>,
}

impl Default for LegitimacyRules {
    fn default() -> Self {
        Self {
            placeholder_email_domains: vec![
                "placeholder.com".to_string(),
                "example.com".to_string(),
                "example.org".to_string(),
                "test.com".to_string(),
                "mailinator.com".to_string(),
            ],
            fake_phone_sequences: vec![
                "12345678".to_string(),
                "123456789".to_string(),
                "1234567890".to_string(),
                "0123456789".to_string(),
                "9876543210".to_string(),
            ],
            suspicious_name_tokens: vec![
                "test".to_string(),
                "testing".to_string(),
                "dummy".to_string(),
                "placeholder".to_string(),
                "sample".to_string(),
                "asdf".to_string(),
                "qwerty".to_string(),
                "delete".to_string(),
            ],
        }
    }
}

/// Scan customer identity fields for signals of non-genuine data. Pure and
/// read-only; runs unchanged against artifact rows and live rows.
#[must_use]
pub fn scan_customer_legitimacy(
    customers: &[CustomerRecord],
    rules: &LegitimacyRules,
) -> Vec<IntegrityIssue> {
    let mut issues: Vec<IntegrityIssue> = Vec::new();

    for record in customers {
        if let Some(email) = &record.email {
            let lowered = email.trim().to_lowercase();
            if let Some((_, domain)) = lowered.rsplit_once('@') {
                // Suffix match: a subdomain of a placeholder domain counts too.
                if rules.placeholder_email_domains.iter().any(|candidate| {
                    let candidate = candidate.to_lowercase();
                    domain == candidate || domain.ends_with(&format!(".{candidate}"))
                }) {
                    issues.push(IntegrityIssue {
                        code: IssueCode::PlaceholderEmail,
                        table: TABLE_CUSTOMERS.to_string(),
                        detail: format!(
                            "customer {} email uses placeholder domain {domain}",
                            record.customer_id
                        ),
                    });
                }
            }
        }

        let digits = record.phone_number.chars().filter(char::is_ascii_digit).collect::<String>();
        if digits.len() >= 6 {
            let mut distinct = digits.chars().collect::<Vec<_>>();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.len() == 1 {
                issues.push(IntegrityIssue {
                    code: IssueCode::DegeneratePhone,
                    table: TABLE_CUSTOMERS.to_string(),
                    detail: format!(
                        "customer {} phone number repeats a single digit",
                        record.customer_id
                    ),
                });
            } else if rules
                .fake_phone_sequences
                .iter()
                .any(|sequence| digits == *sequence || normalize_phone(&record.phone_number) == *sequence)
            {
                issues.push(IntegrityIssue {
                    code: IssueCode::DegeneratePhone,
                    table: TABLE_CUSTOMERS.to_string(),
                    detail: format!(
                        "customer {} phone number is a known fake sequence",
                        record.customer_id
                    ),
                });
            }
        }

        let first_key = normalize_name_part(&record.first_name);
        let last_key = normalize_name_part(&record.last_name);
        for token in first_key.split(' ').chain(last_key.split(' ')) {
            if rules.suspicious_name_tokens.iter().any(|entry| entry.to_lowercase() == token) {
                issues.push(IntegrityIssue {
                    code: IssueCode::SuspiciousName,
                    table: TABLE_CUSTOMERS.to_string(),
                    detail: format!(
                        "customer {} name contains suspicious token \"{token}\"",
                        record.customer_id
                    ),
                });
            }
        }
    }

    issues
}

/// Recompute table digests over the given rows and compare against stored
/// entries. Shared by pre-restore validation (artifact rows) and post-restore
/// verification (live rows).
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when a row cannot be serialized.
pub fn verify_table_digests(
    customers: &[CustomerRecord],
    sales: &[SaleRecord],
    expected: &[TableDigest],
) -> Result<Vec<IntegrityIssue>, LedgerError> {
    let mut issues: Vec<IntegrityIssue> = Vec::new();
    let actual = [
        (TABLE_CUSTOMERS, customers_table_digest(customers)?, customers.len()),
        (TABLE_SALES, sales_table_digest(sales)?, sales.len()),
    ];

    for (table, digest, rows) in actual {
        let Some(stored) = expected.iter().find(|entry| entry.table == table) else {
            issues.push(IntegrityIssue {
                code: IssueCode::MissingDigest,
                table: table.to_string(),
                detail: format!("no stored digest for table {table}"),
            });
            continue;
        };

        if stored.sha256 != digest {
            issues.push(IntegrityIssue {
                code: IssueCode::DigestMismatch,
                table: table.to_string(),
                detail: format!(
                    "stored digest {} does not match recomputed digest {digest}",
                    stored.sha256
                ),
            });
        }

        if stored.rows != rows {
            issues.push(IntegrityIssue {
                code: IssueCode::RowCountMismatch,
                table: table.to_string(),
                detail: format!("stored row count {} does not match actual {rows}", stored.rows),
            });
        }
    }

    Ok(issues)
}

/// Full pre-restore validation of a snapshot artifact.
///
/// The format version gates everything: an unknown version is rejected
/// immediately and no digest comparison is attempted. Otherwise the digest,
/// row-validity, legitimacy, and referential passes all run and every issue
/// found is returned, never just the first.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when a row cannot be serialized
/// for digest recomputation.
pub fn validate_artifact(
    artifact: &SnapshotArtifact,
    rules: &LegitimacyRules,
) -> Result<Vec<IntegrityIssue>, LedgerError> {
    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
        return Ok(vec![IntegrityIssue {
            code: IssueCode::UnsupportedFormatVersion,
            table: "artifact".to_string(),
            detail: format!(
                "format_version {} is not supported (expected {ARTIFACT_FORMAT_VERSION})",
                artifact.format_version
            ),
        }]);
    }

    let mut issues = verify_table_digests(
        &artifact.tables.customers,
        &artifact.tables.sales,
        &artifact.metadata.tables,
    )?;

    for record in &artifact.tables.customers {
        if let Err(err) = record.validate() {
            issues.push(IntegrityIssue {
                code: IssueCode::InvalidRow,
                table: TABLE_CUSTOMERS.to_string(),
                detail: format!("customer {}: {err}", record.customer_id),
            });
        }
    }
    for sale in &artifact.tables.sales {
        if let Err(err) = sale.validate() {
            issues.push(IntegrityIssue {
                code: IssueCode::InvalidRow,
                table: TABLE_SALES.to_string(),
                detail: format!("sale {}: {err}", sale.sale_id),
            });
        }
    }

    issues.extend(scan_customer_legitimacy(&artifact.tables.customers, rules));

    let customer_ids = artifact
        .tables
        .customers
        .iter()
        .map(|record| record.customer_id)
        .collect::<BTreeSet<_>>();
    for sale in &artifact.tables.sales {
        if !customer_ids.contains(&sale.customer_id) {
            issues.push(IntegrityIssue {
                code: IssueCode::OrphanSale,
                table: TABLE_SALES.to_string(),
                detail: format!(
                    "sale {} references missing customer {}",
                    sale.sale_id, sale.customer_id
                ),
            });
        }
    }

    Ok(issues)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Requested,
    Validated,
    SafetySnapshot,
    Cleared,
    Loaded,
    Verified,
    Committed,
    Aborted,
}

impl RestorePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::SafetySnapshot => "safety_snapshot",
            Self::Cleared => "cleared",
            Self::Loaded => "loaded",
            Self::Verified => "verified",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreReport {
    pub artifact_id: ArtifactId,
    pub safety_artifact_id: ArtifactId,
    pub committed_counts: BTreeMap<String, usize>,
    pub phases: Vec<RestorePhase>,
}
