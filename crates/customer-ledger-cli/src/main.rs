use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use clap::{Args, Parser, Subcommand, ValueEnum};
use customer_ledger_core::{
    classify_candidate, filter_customers, ArtifactId, ConfidenceTier, CustomerId, CustomerRecord,
    DuplicateCheckPolicy, ExclusionIndex, IntakeCandidate, LegitimacyRules, RestorePhase, SaleId,
    SaleRecord, SnapshotArtifact,
};
use customer_ledger_store_sqlite::{LedgerStore, StoreError};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const ENCRYPTION_MAGIC: &[u8] = b"CLENC1";
const ENCRYPTION_ALGORITHM: &str = "xchacha20poly1305";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "cledger")]
#[command(about = "Customer Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./customer_ledger.sqlite3")]
    db: PathBuf,

    /// JSON file overriding the default content-legitimacy rules.
    #[arg(long)]
    rules_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Intake {
        #[command(subcommand)]
        command: Box<IntakeCommand>,
    },
    Customer {
        #[command(subcommand)]
        command: Box<CustomerCommand>,
    },
    Sale {
        #[command(subcommand)]
        command: Box<SaleCommand>,
    },
    Export {
        #[command(subcommand)]
        command: Box<ExportCommand>,
    },
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum IntakeCommand {
    Check(IntakeCheckArgs),
}

#[derive(Debug, Args)]
struct IntakeCheckArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: String,
}

#[derive(Debug, Subcommand)]
enum CustomerCommand {
    Add(CustomerAddArgs),
    List,
}

#[derive(Debug, Args)]
struct CustomerAddArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: String,
    #[arg(long)]
    account_number: Option<String>,
    #[arg(long)]
    created_by: String,
    #[arg(long)]
    created_at: Option<String>,
    #[arg(long, value_enum, default_value = "fail-closed")]
    duplicate_policy: PolicyArg,
}

#[derive(Debug, Subcommand)]
enum SaleCommand {
    Add(SaleAddArgs),
    List,
}

#[derive(Debug, Args)]
struct SaleAddArgs {
    #[arg(long)]
    customer_id: String,
    #[arg(long)]
    total_cost_cents: i64,
    #[arg(long)]
    created_by: String,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ExportCommand {
    Filter(ExportFilterArgs),
}

#[derive(Debug, Args)]
struct ExportFilterArgs {
    #[arg(long)]
    exclusion_file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Create(SnapshotCreateArgs),
    List,
    Show(SnapshotRefArgs),
    Validate(SnapshotRefArgs),
    Restore(SnapshotRestoreArgs),
    Export(SnapshotExportArgs),
    Import(SnapshotImportArgs),
}

#[derive(Debug, Args)]
struct SnapshotCreateArgs {
    #[arg(long)]
    reason: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct SnapshotRefArgs {
    #[arg(long)]
    artifact_id: String,
}

#[derive(Debug, Args)]
struct SnapshotRestoreArgs {
    #[arg(long)]
    artifact_id: String,
    #[arg(long)]
    confirm_token: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct SnapshotExportArgs {
    #[arg(long)]
    artifact_id: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
    #[arg(long)]
    encrypt_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SnapshotImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long)]
    decrypt_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    FailClosed,
    FailOpen,
}

impl PolicyArg {
    fn into_policy(self) -> DuplicateCheckPolicy {
        match self {
            Self::FailClosed => DuplicateCheckPolicy::FailClosed,
            Self::FailOpen => DuplicateCheckPolicy::FailOpen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct OffsiteSecurityMetadata {
    document_sha256: String,
    encryption_algorithm: Option<String>,
    signature_file: Option<String>,
    signature_algorithm: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = LedgerStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Intake { command } => run_intake(*command, &mut store),
        Command::Customer { command } => run_customer(*command, &mut store),
        Command::Sale { command } => run_sale(*command, &mut store),
        Command::Export { command } => run_export(*command, &mut store),
        Command::Snapshot { command } => {
            run_snapshot(*command, &mut store, cli.rules_file.as_deref())
        }
    }
}

fn run_db(command: DbCommand, store: &mut LedgerStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut LedgerStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_intake(command: IntakeCommand, store: &mut LedgerStore) -> Result<()> {
    store.migrate()?;
    match command {
        IntakeCommand::Check(args) => {
            let candidate = IntakeCandidate {
                first_name: args.first_name,
                last_name: args.last_name,
                email: args.email,
                phone_number: args.phone_number,
            };
            let existing = store.list_customers()?;
            let result = classify_candidate(&candidate, &existing)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize match result")?)
        }
    }
}

fn run_customer(command: CustomerCommand, store: &mut LedgerStore) -> Result<()> {
    store.migrate()?;
    match command {
        CustomerCommand::Add(args) => run_customer_add(args, store),
        CustomerCommand::List => {
            let customers = store.list_customers()?;
            emit_json(serde_json::json!({ "customers": customers }))
        }
    }
}

fn run_customer_add(args: CustomerAddArgs, store: &mut LedgerStore) -> Result<()> {
    let created_at = parse_optional_rfc3339(args.created_at.as_deref())?;
    let record = CustomerRecord {
        customer_id: CustomerId::new(),
        first_name: args.first_name,
        last_name: args.last_name,
        email: args.email,
        phone_number: args.phone_number,
        account_number: args.account_number,
        created_by: args.created_by,
        created_at,
    };
    record.validate()?;

    let duplicate_check = match store.list_customers() {
        Ok(existing) => {
            let candidate = IntakeCandidate {
                first_name: record.first_name.clone(),
                last_name: record.last_name.clone(),
                email: record.email.clone(),
                phone_number: record.phone_number.clone(),
            };
            let result = classify_candidate(&candidate, &existing)?;
            if matches!(
                result.confidence,
                Some(ConfidenceTier::High | ConfidenceTier::Medium)
            ) {
                return Err(StoreError::Duplicate(result.reason).into());
            }
            Some(result)
        }
        Err(err) => match args.duplicate_policy.into_policy() {
            DuplicateCheckPolicy::FailClosed => return Err(err.into()),
            DuplicateCheckPolicy::FailOpen => None,
        },
    };

    store.insert_customer(&record)?;
    emit_json(serde_json::json!({
        "customer": record,
        "duplicate_check": duplicate_check
    }))
}

fn run_sale(command: SaleCommand, store: &mut LedgerStore) -> Result<()> {
    store.migrate()?;
    match command {
        SaleCommand::Add(args) => {
            let sale = SaleRecord {
                sale_id: SaleId::new(),
                customer_id: parse_customer_id(&args.customer_id)?,
                total_cost_cents: args.total_cost_cents,
                created_by: args.created_by,
                created_at: parse_optional_rfc3339(args.created_at.as_deref())?,
            };
            store.insert_sale(&sale)?;
            emit_json(serde_json::to_value(&sale).context("failed to serialize sale record")?)
        }
        SaleCommand::List => {
            let sales = store.list_sales()?;
            emit_json(serde_json::json!({ "sales": sales }))
        }
    }
}

fn run_export(command: ExportCommand, store: &mut LedgerStore) -> Result<()> {
    store.migrate()?;
    match command {
        ExportCommand::Filter(args) => {
            let body = fs::read_to_string(&args.exclusion_file).with_context(|| {
                format!("failed to read exclusion file {}", args.exclusion_file.display())
            })?;
            let lines = body.lines().map(str::to_string).collect::<Vec<_>>();

            let index = ExclusionIndex::build(&lines);
            let records = store.list_customers()?;
            let outcome = filter_customers(&records, &index)?;
            emit_json(serde_json::json!({
                "kept": outcome.kept,
                "excluded": outcome.excluded,
                "exclusion_key_counts": index.key_counts()
            }))
        }
    }
}

fn run_snapshot(
    command: SnapshotCommand,
    store: &mut LedgerStore,
    rules_file: Option<&Path>,
) -> Result<()> {
    store.migrate()?;
    let rules = load_rules(rules_file)?;
    match command {
        SnapshotCommand::Create(args) => {
            let artifact = store.create_snapshot(&args.reason, &args.actor)?;
            emit_json(
                serde_json::to_value(artifact.summary())
                    .context("failed to serialize snapshot summary")?,
            )
        }
        SnapshotCommand::List => {
            let snapshots = store.list_snapshots()?;
            emit_json(serde_json::json!({ "snapshots": snapshots }))
        }
        SnapshotCommand::Show(args) => {
            let artifact_id = parse_artifact_id(&args.artifact_id)?;
            let Some(artifact) = store.get_snapshot(artifact_id)? else {
                return Err(StoreError::NotFound(format!(
                    "snapshot artifact {artifact_id} not found"
                ))
                .into());
            };
            emit_json(
                serde_json::to_value(&artifact).context("failed to serialize snapshot artifact")?,
            )
        }
        SnapshotCommand::Validate(args) => {
            let artifact_id = parse_artifact_id(&args.artifact_id)?;
            let issues = store.validate_snapshot(artifact_id, &rules)?;
            emit_json(serde_json::json!({
                "artifact_id": artifact_id.to_string(),
                "valid": issues.is_empty(),
                "issues": issues
            }))
        }
        SnapshotCommand::Restore(args) => run_snapshot_restore(&args, store, &rules),
        SnapshotCommand::Export(args) => run_snapshot_export(&args, store),
        SnapshotCommand::Import(args) => run_snapshot_import(&args, store, &rules),
    }
}

fn run_snapshot_restore(
    args: &SnapshotRestoreArgs,
    store: &mut LedgerStore,
    rules: &LegitimacyRules,
) -> Result<()> {
    let artifact_id = parse_artifact_id(&args.artifact_id)?;
    match store.restore_snapshot(artifact_id, &args.confirm_token, &args.actor, rules) {
        Ok(report) => emit_json(
            serde_json::to_value(&report).context("failed to serialize restore report")?,
        ),
        Err(err) => {
            let issues = match &err {
                StoreError::Integrity { issues, .. } | StoreError::FatalRestore { issues, .. } => {
                    issues.clone()
                }
                _ => Vec::new(),
            };
            emit_json(serde_json::json!({
                "status": "rejected",
                "phase": RestorePhase::Aborted.as_str(),
                "error": err.to_string(),
                "issues": issues
            }))?;
            Err(err.into())
        }
    }
}

fn run_snapshot_export(args: &SnapshotExportArgs, store: &mut LedgerStore) -> Result<()> {
    let artifact_id = parse_artifact_id(&args.artifact_id)?;
    let Some(mut artifact) = store.get_snapshot(artifact_id)? else {
        return Err(
            StoreError::NotFound(format!("snapshot artifact {artifact_id} not found")).into()
        );
    };

    // The document form is size-free; size_bytes is a store column concern.
    artifact.metadata.size_bytes = None;
    let mut payload = serde_json::to_vec_pretty(&artifact)
        .context("failed to serialize snapshot artifact for export")?;

    let mut security = OffsiteSecurityMetadata::default();

    if let Some(key_path) = args.encrypt_key_file.as_ref() {
        let key = read_hex_key_file(key_path)?;
        payload = encrypt_payload_bytes(&key, &payload)?;
        security.encryption_algorithm = Some(ENCRYPTION_ALGORITHM.to_string());
    }

    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create export directory {}", parent.display())
        })?;
    }
    fs::write(&args.out, &payload)
        .with_context(|| format!("failed to write export file {}", args.out.display()))?;
    security.document_sha256 = sha256_hex(&payload);

    if let Some(key_path) = args.signing_key_file.as_ref() {
        let key = read_hex_key_file(key_path)?;
        let signature_hex = sign_payload_bytes(&key, &payload)?;
        let sig_path = signature_path(&args.out);
        fs::write(&sig_path, signature_hex)
            .with_context(|| format!("failed to write signature file {}", sig_path.display()))?;
        security.signature_file =
            sig_path.file_name().map(|name| name.to_string_lossy().into_owned());
        security.signature_algorithm = Some(SIGNATURE_ALGORITHM.to_string());
    } else {
        remove_if_exists(&signature_path(&args.out))?;
    }

    if security.encryption_algorithm.is_some() || security.signature_algorithm.is_some() {
        write_security_metadata(&args.out, &security)?;
    } else {
        remove_if_exists(&security_metadata_path(&args.out))?;
    }

    emit_json(serde_json::json!({
        "artifact_id": artifact_id.to_string(),
        "out_file": args.out,
        "bytes_written": payload.len(),
        "encrypted": security.encryption_algorithm.is_some(),
        "signed": security.signature_algorithm.is_some()
    }))
}

fn run_snapshot_import(
    args: &SnapshotImportArgs,
    store: &mut LedgerStore,
    rules: &LegitimacyRules,
) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;
    let decrypt_key =
        args.decrypt_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;

    let payload = fs::read(&args.input)
        .with_context(|| format!("failed to read snapshot file {}", args.input.display()))?;
    let security = read_security_metadata(&args.input)?;

    let sig_path = signature_path(&args.input);
    if sig_path.exists() {
        let key = verify_key.ok_or_else(|| {
            anyhow!(
                "snapshot file is signed; provide --verify-key-file to verify {}",
                sig_path.display()
            )
        })?;
        verify_payload_signature(&sig_path, &payload, &key)?;
    } else if !args.allow_unsigned {
        return Err(anyhow!(
            "snapshot file is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }

    if let Some(metadata) = &security {
        if metadata.document_sha256 != sha256_hex(&payload) {
            return Err(anyhow!(
                "snapshot file does not match its recorded digest: {}",
                args.input.display()
            ));
        }
    }

    let document = if payload.starts_with(ENCRYPTION_MAGIC) {
        if let Some(metadata) = &security {
            if metadata.encryption_algorithm.as_deref() != Some(ENCRYPTION_ALGORITHM) {
                return Err(anyhow!(
                    "unsupported encryption algorithm recorded for {}",
                    args.input.display()
                ));
            }
        }
        let key = decrypt_key.ok_or_else(|| {
            anyhow!(
                "snapshot file is encrypted; provide --decrypt-key-file to import {}",
                args.input.display()
            )
        })?;
        decrypt_payload_bytes(&key, &payload)?
    } else {
        payload
    };

    let artifact: SnapshotArtifact = serde_json::from_slice(&document)
        .with_context(|| format!("failed to parse snapshot artifact {}", args.input.display()))?;

    match store.import_artifact(&artifact, rules) {
        Ok(summary) => emit_json(serde_json::json!({
            "in_file": args.input,
            "summary": summary
        })),
        Err(err) => {
            if let StoreError::Integrity { issues, .. } = &err {
                emit_json(serde_json::json!({
                    "status": "rejected",
                    "error": err.to_string(),
                    "issues": issues
                }))?;
            }
            Err(err.into())
        }
    }
}

fn load_rules(path: Option<&Path>) -> Result<LegitimacyRules> {
    match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read rules file {}", path.display()))?;
            serde_json::from_str(&body)
                .with_context(|| format!("failed to parse rules file {}", path.display()))
        }
        None => Ok(LegitimacyRules::default()),
    }
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let trimmed = body.trim();
    let bytes = hex::decode(trimmed)
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn sign_payload_bytes(key: &[u8; 32], payload: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signing key: {err}"))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_payload_signature(sig_path: &Path, payload: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_body = fs::read_to_string(sig_path)
        .with_context(|| format!("failed to read signature file {}", sig_path.display()))?;
    let signature = hex::decode(signature_body.trim())
        .with_context(|| format!("signature file is not valid hex: {}", sig_path.display()))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(payload);
    mac.verify_slice(&signature)
        .map_err(|_| anyhow!("signature verification failed for {}", sig_path.display()))
}

fn encrypt_payload_bytes(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0_u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|err| anyhow!("failed to encrypt snapshot payload: {err}"))?;

    let mut out = Vec::with_capacity(ENCRYPTION_MAGIC.len() + nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(ENCRYPTION_MAGIC);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_payload_bytes(key: &[u8; 32], encrypted: &[u8]) -> Result<Vec<u8>> {
    if encrypted.len() <= ENCRYPTION_MAGIC.len() + 24 {
        return Err(anyhow!("encrypted snapshot payload is too short"));
    }
    if !encrypted.starts_with(ENCRYPTION_MAGIC) {
        return Err(anyhow!("encrypted snapshot payload is missing expected header"));
    }

    let nonce_start = ENCRYPTION_MAGIC.len();
    let nonce_end = nonce_start + 24;
    let nonce = XNonce::from_slice(&encrypted[nonce_start..nonce_end]);
    let ciphertext = &encrypted[nonce_end..];
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|err| anyhow!("failed to decrypt snapshot payload: {err}"))
}

fn signature_path(out_file: &Path) -> PathBuf {
    let mut name = out_file.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

fn security_metadata_path(out_file: &Path) -> PathBuf {
    let mut name = out_file.as_os_str().to_os_string();
    name.push(".security.json");
    PathBuf::from(name)
}

fn write_security_metadata(out_file: &Path, metadata: &OffsiteSecurityMetadata) -> Result<()> {
    let path = security_metadata_path(out_file);
    let body =
        serde_json::to_vec_pretty(metadata).context("failed to serialize security metadata")?;
    fs::write(&path, body)
        .with_context(|| format!("failed to write security metadata {}", path.display()))
}

fn read_security_metadata(in_file: &Path) -> Result<Option<OffsiteSecurityMetadata>> {
    let path = security_metadata_path(in_file);
    if !path.exists() {
        return Ok(None);
    }

    let body = fs::read_to_string(&path)
        .with_context(|| format!("failed to read security metadata {}", path.display()))?;
    let metadata: OffsiteSecurityMetadata = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse security metadata {}", path.display()))?;
    Ok(Some(metadata))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn parse_customer_id(value: &str) -> Result<CustomerId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(CustomerId(parsed))
}

fn parse_artifact_id(value: &str) -> Result<ArtifactId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(ArtifactId(parsed))
}
