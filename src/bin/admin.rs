use std::collections::VecDeque;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use keytrans_sequencer::crypto::{sha256, SigningKeyPair};
use keytrans_sequencer::infra::{BatchStore, MutationQueue, PgBatchStore, PgMutationLog};
use keytrans_sequencer::sequencer::read_revision_mutations;
use keytrans_sequencer::{DirectoryId, LogId, MapIndex};

fn print_help() {
    eprintln!(
        "\
keytrans-sequencer-admin

USAGE:
  keytrans-sequencer-admin <command> [options]

COMMANDS:
  init-db                         Create the mutation log and batch tables
  create-log                      Register a mutation log for a directory
  set-writable                    Open or close a mutation log for writes
  enqueue-mutation                Sign an entry update and append it to a log
  show-batch                      Print the batch definition of a revision
  list-mutations                  Print the mutations a revision consumed

COMMON OPTIONS:
  --database-url <postgres_url>   (defaults to env DATABASE_URL)

create-log OPTIONS:
  --directory-id <id>             (required)
  --log-id <n>                    (required)

set-writable OPTIONS:
  --directory-id <id>             (required)
  --log-id <n>                    (required)
  --writable <true|false>         (required)

enqueue-mutation OPTIONS:
  --directory-id <id>             (required)
  --log-id <n>                    (required)
  --user-id <id>                  (required)
  --version <n>                   (required)
  --public-key <data>             (repeatable) Key material published for the user
  --index <hex>                   (optional) Map index; defaults to SHA256(user-id)
  --signing-key <hex>             (optional) Ed25519 secret; generated when omitted

show-batch OPTIONS:
  --directory-id <id>             (required)
  --revision <n>                  (required)

list-mutations OPTIONS:
  --directory-id <id>             (required)
  --revision <n>                  (required)
  --page-size <n>                 (default: 500)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn take_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn required<T>(value: Option<T>, flag: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow::anyhow!("{flag} is required"))
}

fn parse_directory(raw: &str) -> anyhow::Result<DirectoryId> {
    DirectoryId::parse(raw).map_err(|e| anyhow::anyhow!(e))
}

async fn connect(database_url: Option<String>) -> anyhow::Result<PgPool> {
    let database_url = require_database_url(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    Ok(pool)
}

/// Options shared by every command
#[derive(Default)]
struct Options {
    database_url: Option<String>,
    directory_id: Option<DirectoryId>,
    log_id: Option<LogId>,
    revision: Option<u64>,
    writable: Option<bool>,
    user_id: Option<String>,
    version: Option<u64>,
    public_keys: Vec<String>,
    index: Option<MapIndex>,
    signing_key: Option<String>,
    page_size: Option<u64>,
}

impl Options {
    /// Returns `None` if help was requested
    fn parse(mut args: VecDeque<String>) -> anyhow::Result<Option<Self>> {
        let mut options = Options::default();
        while let Some(arg) = args.pop_front() {
            match arg.as_str() {
                "--database-url" => {
                    options.database_url = Some(take_value(&mut args, "--database-url")?);
                }
                "--directory-id" => {
                    let raw = take_value(&mut args, "--directory-id")?;
                    options.directory_id = Some(parse_directory(&raw)?);
                }
                "--log-id" => {
                    let raw = take_value(&mut args, "--log-id")?;
                    options.log_id = Some(LogId::new(raw.parse()?));
                }
                "--revision" => {
                    options.revision = Some(take_value(&mut args, "--revision")?.parse()?);
                }
                "--writable" => {
                    options.writable = Some(take_value(&mut args, "--writable")?.parse()?);
                }
                "--user-id" => options.user_id = Some(take_value(&mut args, "--user-id")?),
                "--version" => {
                    options.version = Some(take_value(&mut args, "--version")?.parse()?);
                }
                "--public-key" => options.public_keys.push(take_value(&mut args, "--public-key")?),
                "--index" => {
                    let raw = take_value(&mut args, "--index")?;
                    options.index = Some(MapIndex::from_hex(&raw).map_err(|e| anyhow::anyhow!(e))?);
                }
                "--signing-key" => {
                    options.signing_key = Some(take_value(&mut args, "--signing-key")?);
                }
                "--page-size" => {
                    options.page_size = Some(take_value(&mut args, "--page-size")?.parse()?);
                }
                "-h" | "--help" => return Ok(None),
                other => anyhow::bail!("unexpected argument: {other}"),
            }
        }
        Ok(Some(options))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let Some(options) = Options::parse(args)? else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "init-db" => {
            let pool = connect(options.database_url).await?;
            PgMutationLog::new(pool.clone()).initialize().await?;
            PgBatchStore::new(pool).initialize().await?;
            println!("ok: tables initialized");
            Ok(())
        }
        "create-log" => {
            let directory_id = required(options.directory_id, "--directory-id")?;
            let log_id = required(options.log_id, "--log-id")?;
            let pool = connect(options.database_url).await?;
            PgMutationLog::new(pool)
                .create_log(&directory_id, log_id)
                .await?;
            println!("ok: log {log_id} registered in directory {directory_id}");
            Ok(())
        }
        "set-writable" => {
            let directory_id = required(options.directory_id, "--directory-id")?;
            let log_id = required(options.log_id, "--log-id")?;
            let writable = required(options.writable, "--writable")?;
            let pool = connect(options.database_url).await?;
            PgMutationLog::new(pool)
                .set_writable(&directory_id, log_id, writable)
                .await?;
            println!("ok: log {log_id} writable={writable}");
            Ok(())
        }
        "enqueue-mutation" => {
            let directory_id = required(options.directory_id, "--directory-id")?;
            let log_id = required(options.log_id, "--log-id")?;
            let user_id = required(options.user_id, "--user-id")?;
            let version = required(options.version, "--version")?;

            let key = match options.signing_key.as_deref() {
                Some(hex) => SigningKeyPair::from_hex(hex)?,
                None => {
                    let key = SigningKeyPair::generate();
                    eprintln!("generated signing key: {}", hex::encode(key.to_bytes()));
                    key
                }
            };
            let index = options
                .index
                .unwrap_or_else(|| MapIndex::from_bytes(sha256(user_id.as_bytes())));
            let entry = key.sign_entry(index, user_id, version, options.public_keys);

            let pool = connect(options.database_url).await?;
            let watermark = PgMutationLog::new(pool)
                .send(&directory_id, log_id, entry.to_bytes())
                .await?;
            println!(
                "ok: enqueued index={} version={} log={} watermark={}",
                entry.index, entry.version, log_id, watermark
            );
            Ok(())
        }
        "show-batch" => {
            let directory_id = required(options.directory_id, "--directory-id")?;
            let revision = required(options.revision, "--revision")?;
            let pool = connect(options.database_url).await?;
            let definition = PgBatchStore::new(pool)
                .read_batch(&directory_id, revision)
                .await?;
            println!("{}", serde_json::to_string_pretty(&definition)?);
            Ok(())
        }
        "list-mutations" => {
            let directory_id = required(options.directory_id, "--directory-id")?;
            let revision = required(options.revision, "--revision")?;
            let page_size = options.page_size.unwrap_or(500);
            let pool = connect(options.database_url).await?;
            let reader = PgMutationLog::new(pool.clone());
            let batches = PgBatchStore::new(pool);

            let mut page_token = String::new();
            loop {
                let page = read_revision_mutations(
                    &reader,
                    &batches,
                    &directory_id,
                    revision,
                    &page_token,
                    page_size,
                )
                .await?;
                for message in &page.messages {
                    println!("{}", serde_json::to_string(message)?);
                }
                if page.next_page_token.is_empty() {
                    break;
                }
                page_token = page.next_page_token;
            }
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}\n");
            print_help();
            anyhow::bail!("unknown command: {other}");
        }
    }
}
