//! CLI - operator commands against the record store
//!
//! Available Commands:
//! - membersys init-schema                      - Create tables / keyspace
//! - membersys create <file>                    - Store a new application from JSON
//! - membersys list <state>                     - Enumerate records in a state
//! - membersys show <state> <key>               - Print one record
//! - membersys user <username>                  - Look up a member by username
//! - membersys move <key> <from> <to> --by UID  - Lifecycle transition
//! - membersys attach <key> <file>              - Attach the signed agreement
//! - membersys set <key> <field> <value>        - Update a member field
//! - membersys fee <key> <amount> [--yearly]    - Update the membership fee
//! - membersys reclaim                          - Drop expired records

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use membersys_core::config::MembersysConfig;
use membersys_core::{
    BoolField, KeyedAgreement, LongField, MemberState, MembershipAgreement, TextField,
    system_clock,
};
use membersys_storage::stream::DEFAULT_BATCH_SIZE;
use membersys_storage::{EnumerateQuery, SharedStore, enumerate_stream, open_store};

#[derive(Debug, Clone, Copy, Default, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Pretty,
    Json,
}

/// membersys CLI
#[derive(Parser, Debug)]
#[command(name = "membersys")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "MEMBERSYS_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Create the backend schema if missing
    InitSchema,

    /// Store a new application read from a JSON file
    Create(CreateArgs),

    /// List records in a lifecycle state
    List(ListArgs),

    /// Show a single record
    Show(ShowArgs),

    /// Look up a member by username
    User(UserArgs),

    /// Move a record between lifecycle states
    Move(MoveArgs),

    /// Attach the signed membership agreement
    Attach(AttachArgs),

    /// Update a text, flag or numeric member field
    Set(SetArgs),

    /// Update the membership fee
    Fee(FeeArgs),

    /// Remove records whose retention has expired
    Reclaim,
}

#[derive(Args, Debug)]
pub(crate) struct CreateArgs {
    /// JSON-encoded membership agreement
    file: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct ListArgs {
    /// Lifecycle state to list
    #[arg(value_parser = parse_state)]
    state: MemberState,

    /// Only records after this key
    #[arg(long, default_value = "")]
    after: String,

    /// Maximum number of records (0 = all)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Case-insensitive name prefix
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct ShowArgs {
    #[arg(value_parser = parse_state)]
    state: MemberState,
    key: String,
}

#[derive(Args, Debug)]
pub(crate) struct UserArgs {
    username: String,
}

#[derive(Args, Debug)]
pub(crate) struct MoveArgs {
    key: String,
    #[arg(value_parser = parse_state)]
    from: MemberState,
    #[arg(value_parser = parse_state)]
    to: MemberState,

    /// Identifier of the person performing the transition
    #[arg(long = "by")]
    initiator: String,

    /// Reason recorded when a membership ends
    #[arg(long)]
    reason: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct AttachArgs {
    key: String,
    /// Signed agreement scan
    file: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct SetArgs {
    key: String,
    field: String,
    value: String,
}

#[derive(Args, Debug)]
pub(crate) struct FeeArgs {
    key: String,
    /// Amount in the smallest currency unit
    amount: u64,
    /// Fee is paid yearly instead of monthly
    #[arg(long)]
    yearly: bool,
}

fn parse_state(s: &str) -> Result<MemberState, String> {
    MemberState::from_str(s).map_err(|e| e.to_string())
}

/// Member field named on the command line, with its value parsed
#[derive(Debug, PartialEq)]
enum FieldUpdate {
    Text(String),
    Bool(bool),
    Long(u64),
}

impl FieldUpdate {
    fn parse(field: &str, value: &str) -> Result<Self> {
        if TextField::from_str(field).is_ok() {
            return Ok(FieldUpdate::Text(value.to_string()));
        }
        if BoolField::from_str(field).is_ok() {
            let flag = value
                .parse::<bool>()
                .with_context(|| format!("{field} expects true or false, got {value:?}"))?;
            return Ok(FieldUpdate::Bool(flag));
        }
        if LongField::from_str(field).is_ok() {
            let number = value
                .parse::<u64>()
                .with_context(|| format!("{field} expects an unsigned number, got {value:?}"))?;
            return Ok(FieldUpdate::Long(number));
        }
        bail!("unknown field specified: {field}")
    }
}

fn init_logging(config: &MembersysConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    // stdout carries command output; logs go to stderr
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .context("no configuration given (use --config or MEMBERSYS_CONFIG)")?;
    let config = MembersysConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(&config);

    let store = open_store(&config.database, system_clock())
        .await
        .context("opening record store")?;
    debug!(backend = store.backend_name(), "store ready");

    execute(&store, cli.command, cli.output).await
}

async fn execute(store: &SharedStore, command: Commands, output: OutputFormat) -> Result<()> {
    match command {
        Commands::InitSchema => {
            store.ensure_schema().await?;
            info!(backend = store.backend_name(), "schema ready");
            print_message(output, "schema ready");
        }
        Commands::Create(args) => cmd_create(store, &args.file, output).await?,
        Commands::List(args) => cmd_list(store, args, output).await?,
        Commands::Show(args) => {
            let record = store
                .get(&args.key, args.state)
                .await
                .with_context(|| format!("fetching {} {}", args.state, args.key))?;
            print_record(output, Some(&args.key), &record)?;
        }
        Commands::User(args) => {
            let record = store
                .get_by_username(&args.username)
                .await
                .with_context(|| format!("looking up user {}", args.username))?;
            // The username lookup does not report the record key
            print_record(output, None, &record)?;
        }
        Commands::Move(args) => {
            store
                .move_record_with_reason(
                    &args.key,
                    args.from,
                    args.to,
                    &args.initiator,
                    args.reason.as_deref(),
                )
                .await
                .with_context(|| format!("moving {} from {} to {}", args.key, args.from, args.to))?;
            print_message(output, &format!("{} moved to {}", args.key, args.to));
        }
        Commands::Attach(args) => {
            let document = tokio::fs::read(&args.file)
                .await
                .with_context(|| format!("reading {}", args.file.display()))?;
            store
                .attach_document(&args.key, &document)
                .await
                .with_context(|| format!("attaching document to {}", args.key))?;
            print_message(
                output,
                &format!("attached {} bytes to {}", document.len(), args.key),
            );
        }
        Commands::Set(args) => {
            match FieldUpdate::parse(&args.field, &args.value)? {
                FieldUpdate::Text(value) => {
                    store.set_text_value(&args.key, &args.field, &value).await?
                }
                FieldUpdate::Bool(value) => {
                    store.set_bool_value(&args.key, &args.field, value).await?
                }
                FieldUpdate::Long(value) => {
                    store.set_long_value(&args.key, &args.field, value).await?
                }
            }
            print_message(output, &format!("{} updated on {}", args.field, args.key));
        }
        Commands::Fee(args) => {
            store.set_fee(&args.key, args.amount, args.yearly).await?;
            print_message(output, &format!("fee updated on {}", args.key));
        }
        Commands::Reclaim => {
            let removed = store.reclaim_expired().await?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "removed": removed }));
                }
                OutputFormat::Pretty => println!("removed {removed} expired records"),
            }
        }
    }
    Ok(())
}

async fn cmd_create(store: &SharedStore, file: &Path, output: OutputFormat) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let record: MembershipAgreement = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", file.display()))?;
    let key = store.create(&record).await.context("creating application")?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "key": key })),
        OutputFormat::Pretty => println!("{key}"),
    }
    Ok(())
}

async fn cmd_list(store: &SharedStore, args: ListArgs, output: OutputFormat) -> Result<()> {
    let mut query = EnumerateQuery::new(args.state)
        .after(args.after)
        .limit(args.limit);
    if let Some(prefix) = args.name {
        query = query.name_prefix(prefix);
    }

    let mut records = enumerate_stream(store.clone(), query, DEFAULT_BATCH_SIZE);
    let mut listed = Vec::new();
    while let Some(record) = records.next().await {
        let record = record.with_context(|| format!("listing {}", args.state))?;
        match output {
            OutputFormat::Pretty => println!("{}", summary_line(&record)),
            OutputFormat::Json => listed.push(record),
        }
    }
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
    }
    Ok(())
}

fn summary_line(record: &KeyedAgreement) -> String {
    let member = &record.agreement.member;
    format!("{}  {}  <{}>  {}", record.key, member.name, member.email, member.city)
}

fn print_record(output: OutputFormat, key: Option<&str>, record: &MembershipAgreement) -> Result<()> {
    match output {
        OutputFormat::Json => match key {
            Some(key) => println!(
                "{}",
                serde_json::to_string_pretty(&KeyedAgreement::new(key, record.clone()))?
            ),
            None => println!("{}", serde_json::to_string_pretty(record)?),
        },
        OutputFormat::Pretty => {
            let member = &record.member;
            let meta = &record.metadata;
            if let Some(key) = key {
                println!("{key}");
            }
            println!("  name:      {}", member.name);
            println!(
                "  address:   {}, {} {}, {}",
                member.street, member.zipcode, member.city, member.country
            );
            println!("  email:     {}", member.email);
            println!("  phone:     {}", member.phone);
            if let Some(username) = &member.username {
                println!("  username:  {username}");
            }
            println!(
                "  fee:       {} ({})",
                member.fee,
                if member.fee_yearly { "yearly" } else { "monthly" }
            );
            if let Some(approver) = &meta.approver_uid {
                println!("  approved:  by {approver}");
            }
            if let Some(initiator) = &meta.goodbye_initiator {
                println!("  goodbye:   by {initiator}");
            }
            if record.has_document() {
                println!("  document:  attached");
            }
        }
    }
    Ok(())
}

fn print_message(output: OutputFormat, message: &str) {
    match output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "status": message })),
        OutputFormat::Pretty => println!("{message}"),
    }
}
