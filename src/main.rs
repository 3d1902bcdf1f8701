//! Postbox - persistent in-game mail
//!
//! Command line access to a mail store for operators.

use anyhow::Context;
use clap::{Parser, Subcommand};
use postbox::config::{validate_config, BackendKind, PostboxConfig};
use postbox::groups::{GroupRegistry, GroupStorage, SqliteGroupStorage, YamlGroupStorage};
use postbox::collaborators::MemoryPermissions;
use postbox::model::{Actor, MailRecord, Price};
use postbox::store::{self, FileMailStore, MailStore, OpenedStore, SqliteMailStore};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// Postbox - persistent in-game mail with attachment escrow
#[derive(Parser, Debug)]
#[command(name = "postbox")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/postbox/config.yaml)
    #[arg(short, long, env = "POSTBOX_CONFIG")]
    config: Option<String>,

    /// Override the storage backend (files, sqlite)
    #[arg(short, long)]
    backend: Option<String>,

    /// Log filter, overrides RUST_LOG (e.g. "postbox=debug")
    #[arg(long)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Show a sent mail
    Show {
        /// Mail id
        id: u64,
    },

    /// List mail received by an actor
    Inbox {
        /// Actor token (player:<uuid>, console, dummy:<name>, block:<name>@<world>:<x>:<y>:<z>)
        actor: String,
    },

    /// List mail sent by an actor
    Outbox {
        /// Actor token
        actor: String,
    },

    /// List unread mail of an actor
    Unread {
        /// Actor token
        actor: String,
    },

    /// List an actor's trash
    Trash {
        /// Actor token
        actor: String,
    },

    /// Delete sent mail older than the retention age
    Sweep {
        /// Age in days (default: retention.max_age_days from the config)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// List address groups
    Groups,

    /// Copy all sent mail and groups from the file backend into SQLite
    Migrate,

    /// Print metrics in Prometheus text format
    Metrics,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if let Err(e) = postbox::logging::init_with(cli.log.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    match &cli.config {
        Some(path) => PathBuf::from(path),
        None => PostboxConfig::default_path(),
    }
}

fn run(cli: Cli) -> postbox::Result<()> {
    if let Commands::Init = cli.command {
        return handle_init_command(&config_path(&cli));
    }

    let path = config_path(&cli);
    let mut config = PostboxConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(backend) = &cli.backend {
        config.storage.backend = parse_backend(backend)?;
    }
    if let Err(issues) = validate_config(&config) {
        for issue in &issues {
            eprintln!("config: {}", issue);
        }
        return Err(postbox::MailError::Config(format!(
            "{} configuration problem(s)",
            issues.len()
        )));
    }

    tracing::info!(backend = %config.storage.backend, "Configuration loaded");

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Show { id } => {
            let store = open_store(&config)?;
            print_mail(&store.get(id)?);
            Ok(())
        }
        Commands::Inbox { actor } => list(&config, &actor, |s, a| s.inbox(a), "Inbox"),
        Commands::Outbox { actor } => list(&config, &actor, |s, a| s.outbox(a), "Outbox"),
        Commands::Unread { actor } => list(&config, &actor, |s, a| s.unread(a), "Unread"),
        Commands::Trash { actor } => list(&config, &actor, |s, a| s.trashbox(a), "Trash"),
        Commands::Sweep { days } => handle_sweep_command(&config, days),
        Commands::Groups => handle_groups_command(&config),
        Commands::Migrate => handle_migrate_command(&config),
        Commands::Metrics => {
            // Opening the store records load metrics
            open_store(&config)?;
            print!("{}", postbox::metrics::gather());
            Ok(())
        }
    }
}

fn parse_backend(s: &str) -> postbox::Result<BackendKind> {
    match s.to_lowercase().as_str() {
        "files" | "file" => Ok(BackendKind::Files),
        "sqlite" | "db" => Ok(BackendKind::Sqlite),
        other => Err(postbox::MailError::Config(format!(
            "Unknown backend '{}'. Use files or sqlite.",
            other
        ))),
    }
}

/// Open the configured store and wait for it to be ready
fn open_store(config: &PostboxConfig) -> postbox::Result<Arc<dyn MailStore>> {
    let opened = store::open_configured(config)?;
    if let OpenedStore::Files(files) = &opened {
        files.load()?;
    }
    Ok(opened.as_store())
}

fn list(
    config: &PostboxConfig,
    actor: &str,
    query: impl Fn(&dyn MailStore, &Actor) -> postbox::Result<Vec<MailRecord>>,
    title: &str,
) -> postbox::Result<()> {
    let actor: Actor = actor.parse()?;
    let store = open_store(config)?;
    let mails = query(store.as_ref(), &actor)?;

    println!("{} of {} ({} mail)", title, actor.display_name(), mails.len());
    for mail in &mails {
        print_summary(mail, &actor);
    }
    Ok(())
}

fn print_summary(mail: &MailRecord, viewer: &Actor) {
    let marker = if mail.is_recipient(viewer) && !mail.is_read_by(viewer) {
        "*"
    } else {
        " "
    };
    let when = mail
        .sent_at()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let first_line = mail.body().first().map(String::as_str).unwrap_or("");
    let attachments = if mail.has_attachments() { " [+]" } else { "" };
    println!(
        "{} #{:<6} {}  {:<16} {}{}",
        marker,
        mail.id(),
        when,
        mail.sender().display_name(),
        first_line,
        attachments
    );
}

fn print_mail(mail: &MailRecord) {
    println!("Mail #{}", mail.id());
    println!("  From:     {}", mail.sender());
    if let Some(at) = mail.sent_at() {
        println!("  Sent:     {}", at.to_rfc3339());
    }
    if !mail.recipients().is_empty() {
        let to: Vec<String> = mail.recipients().iter().map(|a| a.to_string()).collect();
        println!("  To:       {}", to.join(", "));
    }
    if !mail.recipient_groups().is_empty() {
        println!("  Groups:   {}", mail.recipient_groups().join(", "));
    }
    if let Some(total) = mail.total_recipients() {
        println!("  Reached:  {} recipient(s)", total.len());
    }
    if let Some(origin) = mail.origin() {
        println!(
            "  Origin:   {} {:.1} {:.1} {:.1}",
            origin.world, origin.x, origin.y, origin.z
        );
    }
    println!();
    for line in mail.body() {
        println!("  {}", line);
    }
    println!();

    if !mail.attachments_original().is_empty() {
        let list = |stacks: &[postbox::model::ItemStack]| {
            stacks
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("  Attachments: {}", list(mail.attachments()));
        println!("  Originally:  {}", list(mail.attachments_original()));
        match mail.price() {
            Price::Free => {}
            Price::Money(amount) => println!("  Price:       {}", amount),
            Price::Item(stack) => println!("  Price:       {}", stack),
        }
        let state = if mail.attachments_refused() {
            "refused"
        } else if mail.attachments_cancelled() {
            "cancelled"
        } else if mail.attachments_opened() {
            "opened"
        } else {
            "waiting"
        };
        println!("  State:       {}", state);
        if let Some(reason) = mail.refusal_reason() {
            println!("  Reason:      {}", reason);
        }
    }
    println!("  Read by {}, trashed by {}", mail.read_by().len(), mail.trashed_by().len());
}

fn handle_init_command(config_file: &Path) -> postbox::Result<()> {
    if config_file.exists() {
        println!("Configuration already exists at {}", config_file.display());
        return Ok(());
    }

    let config = PostboxConfig::new();
    config.save(config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. Pick a backend (storage.backend: files | sqlite)");
    println!("  2. Optionally enable retention (retention.max_age_days)");
    println!("  3. Inspect mail:");
    println!("     postbox inbox player:<uuid>");
    println!("     postbox show <id>");

    Ok(())
}

fn handle_sweep_command(config: &PostboxConfig, days: Option<u32>) -> postbox::Result<()> {
    let days = days.or(config.retention.max_age_days).ok_or_else(|| {
        postbox::MailError::Config(
            "No retention age configured. Pass --days or set retention.max_age_days.".to_string(),
        )
    })?;

    let store = open_store(config)?;
    let deleted = store.delete_older_than(days)?;
    postbox::metrics::record_sweep(store.backend().as_str(), deleted);
    println!("Deleted {} mail older than {} days", deleted, days);
    Ok(())
}

fn group_storage(config: &PostboxConfig, opened: &OpenedStore) -> Box<dyn GroupStorage> {
    match opened.connection() {
        Some(conn) => Box::new(SqliteGroupStorage::new(conn)),
        None => Box::new(YamlGroupStorage::in_dir(&config.storage.data_dir)),
    }
}

fn handle_groups_command(config: &PostboxConfig) -> postbox::Result<()> {
    let opened = store::open_configured(config)?;
    let registry = GroupRegistry::load(
        group_storage(config, &opened),
        Arc::new(MemoryPermissions::new()),
    )?;

    let groups = registry.list();
    if groups.is_empty() {
        println!("No groups");
        return Ok(());
    }
    for group in groups {
        println!(
            "{:<24} owner {:<20} {} member(s)  send={} modify={} dissolve={}",
            group.name,
            group.owner.display_name(),
            group.members.len(),
            group.send_mode,
            group.modify_mode,
            group.dissolution_mode
        );
    }
    Ok(())
}

fn handle_migrate_command(config: &PostboxConfig) -> postbox::Result<()> {
    let source = FileMailStore::open_loaded(&config.storage.data_dir, config.limits)
        .with_context(|| {
            format!(
                "Failed to read mail from {}",
                config.storage.data_dir.display()
            )
        })?;
    let target = SqliteMailStore::open(&config.storage.database, config.limits)
        .with_context(|| {
            format!(
                "Failed to open database {}",
                config.storage.database.display()
            )
        })?;

    if target.latest_id()? > 0 {
        return Err(anyhow::anyhow!(
            "{} already contains mail; migrate into an empty database",
            config.storage.database.display()
        )
        .into());
    }

    let mails = source.all_sent()?;
    for mail in &mails {
        target.import(mail)?;
    }

    let from = YamlGroupStorage::in_dir(&config.storage.data_dir);
    let to = SqliteGroupStorage::new(target.connection());
    let groups = from.load_all()?;
    for group in &groups {
        to.save(group)?;
    }

    println!(
        "✓ Migrated {} mail and {} group(s) into {}",
        mails.len(),
        groups.len(),
        config.storage.database.display()
    );
    Ok(())
}
