use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use subject_registry_api::{RegisterUserRequest, SubjectRegistryApi};
use subject_registry_core::{
    paginate, sort_subjects, BirthDate, OrderByClause, PageRequest, RegistryError, SortOrder,
    SubjectId, SubjectInput, SubjectOrderColumn, DEFAULT_PER_PAGE,
};
use subject_registry_store_sqlite::SqliteStore;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "subjects")]
#[command(about = "Subject Registry CLI")]
struct Cli {
    #[arg(long, env = "SUBJECT_REGISTRY_DB", default_value = "./subject_registry.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Subject {
        #[command(subcommand)]
        command: SubjectCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
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

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Create(UserCreateArgs),
}

#[derive(Debug, Args)]
struct UserCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long, env = "SUBJECT_REGISTRY_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Subcommand)]
enum SubjectCommand {
    /// Create a subject, or overwrite the one with the same name.
    Add(SubjectAddArgs),
    List(SubjectListArgs),
    Show(SubjectShowArgs),
}

#[derive(Debug, Args)]
struct SubjectAddArgs {
    /// Email of the account that will own the subject.
    #[arg(long)]
    owner_email: Option<String>,
    #[arg(long)]
    name: String,
    #[arg(long)]
    test_chamber: i32,
    #[arg(long, value_parser = BirthDate::parse)]
    date_of_birth: BirthDate,
    #[arg(long)]
    score: i32,
    #[arg(long, default_value_t = false)]
    alive: bool,
}

#[derive(Debug, Args)]
struct SubjectListArgs {
    #[arg(long)]
    order_by: Option<OrderColumnArg>,
    #[arg(long, default_value = "asc")]
    order: SortOrderArg,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
    per_page: u32,
}

#[derive(Debug, Args)]
struct SubjectShowArgs {
    #[arg(long)]
    id: SubjectId,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum OrderColumnArg {
    Id,
    Name,
    TestChamber,
    DateOfBirth,
    Score,
    Alive,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortOrderArg {
    Asc,
    Desc,
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
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::User { command } => run_user(command, &SubjectRegistryApi::new(cli.db)),
        Command::Subject { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_subject(command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
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

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_user(command: UserCommand, api: &SubjectRegistryApi) -> Result<()> {
    match command {
        UserCommand::Create(args) => {
            let user = api.register_user(RegisterUserRequest {
                name: args.name,
                email: args.email,
                password: args.password,
            })?;
            emit_json(serde_json::to_value(&user).context("failed to serialize user")?)
        }
    }
}

fn run_subject(command: SubjectCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        SubjectCommand::Add(args) => run_subject_add(args, store),
        SubjectCommand::List(args) => run_subject_list(&args, store),
        SubjectCommand::Show(args) => {
            let subject = store
                .get_subject(args.id)?
                .ok_or_else(|| anyhow!(RegistryError::NotFound(format!("subject {}", args.id))))?;
            emit_json(serde_json::to_value(&subject).context("failed to serialize subject")?)
        }
    }
}

fn run_subject_add(args: SubjectAddArgs, store: &mut SqliteStore) -> Result<()> {
    let owner = match args.owner_email.as_deref() {
        Some(email) => {
            let email = email.trim().to_ascii_lowercase();
            let user = store.find_user_by_email(&email)?.ok_or_else(|| {
                anyhow!(RegistryError::NotFound(format!("user with email {email}")))
            })?;
            Some(user.id)
        }
        None => None,
    };

    let input = SubjectInput {
        name: args.name,
        test_chamber: args.test_chamber,
        date_of_birth: args.date_of_birth,
        score: args.score,
        alive: args.alive,
    }
    .normalized()?;
    let outcome = store.upsert_subject(owner, &input)?;
    emit_json(serde_json::to_value(&outcome).context("failed to serialize subject")?)
}

fn run_subject_list(args: &SubjectListArgs, store: &SqliteStore) -> Result<()> {
    let order = args.order.into_sort_order();
    let order_by = args
        .order_by
        .map(|column| vec![OrderByClause::new(column.into_column(), order)])
        .unwrap_or_default();
    let mut subjects = store.list_subjects()?;
    sort_subjects(&mut subjects, &order_by);
    let page = paginate(subjects, PageRequest::new(args.page, args.per_page));
    emit_json(serde_json::to_value(&page).context("failed to serialize subject page")?)
}

impl OrderColumnArg {
    fn into_column(self) -> SubjectOrderColumn {
        match self {
            Self::Id => SubjectOrderColumn::Id,
            Self::Name => SubjectOrderColumn::Name,
            Self::TestChamber => SubjectOrderColumn::TestChamber,
            Self::DateOfBirth => SubjectOrderColumn::DateOfBirth,
            Self::Score => SubjectOrderColumn::Score,
            Self::Alive => SubjectOrderColumn::Alive,
            Self::CreatedAt => SubjectOrderColumn::CreatedAt,
        }
    }
}

impl SortOrderArg {
    fn into_sort_order(self) -> SortOrder {
        match self {
            Self::Asc => SortOrder::Asc,
            Self::Desc => SortOrder::Desc,
        }
    }
}
