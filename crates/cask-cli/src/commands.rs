use std::fs;
use std::io::{self, Write};

use anyhow::{bail, Context};
use cask_storage::{
    recorded_backend, BackendKind, Capabilities, LeafKind, MigrationReport, Store,
    StoreConfig,
};
use colored::Colorize;

use crate::cli::*;

/// Environment variable holding the secret for encrypted backups.
const BACKUP_SECRET_ENV: &str = "CASK_BACKUP_SECRET";

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;
    match cli.command {
        Command::Status(_) => cmd_status(&config),
        Command::Put(args) => cmd_put(&config, args),
        Command::Get(args) => cmd_get(&config, args),
        Command::Ls(args) => cmd_ls(&config, args),
        Command::Alias(args) => cmd_alias(&config, args),
        Command::Rm(args) => cmd_rm(&config, args),
        Command::Gc(_) => cmd_gc(&config),
        Command::Migrate(args) => cmd_migrate(&mut config, args),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    // One-shot commands never need the background collector.
    config.gc.enabled = false;
    Ok(config)
}

fn capabilities() -> Capabilities {
    match std::env::var(BACKUP_SECRET_ENV) {
        Ok(secret) if !secret.is_empty() => {
            Capabilities::default().with_backup_secret(secret.as_bytes())
        }
        _ => Capabilities::default(),
    }
}

fn open(config: &StoreConfig) -> anyhow::Result<Store> {
    Store::open(config, capabilities())
        .with_context(|| format!("opening store in {}", config.data_dir.display()))
}

fn kind(name: &str) -> anyhow::Result<LeafKind> {
    Ok(name.parse::<LeafKind>()?)
}

fn cmd_status(config: &StoreConfig) -> anyhow::Result<()> {
    let store = open(config)?;
    let root = store.root();
    println!("Data directory: {}", config.data_dir.display().to_string().bold());
    println!("Primary: {}  Backups: {}", config.primary.to_string().cyan(), config.backups.len());
    println!("Sequence: {}", root.sequence().to_string().bold());
    println!("Tree: {}", root.tree_hash().short_hex().yellow());

    let active = root.active_bucket();
    println!(
        "Active bucket: {} ({} objects, inactive {}: {})",
        active.to_string().green().bold(),
        store.object_count(active)?,
        active.other(),
        store.object_count(active.other())?
    );
    if root.gc_last_run() > 0 {
        println!(
            "Last GC: {} (root {})",
            format_timestamp(root.gc_last_run()),
            root.gc_root_hash().short_hex().yellow()
        );
    } else {
        println!("Last GC: {}", "never".dimmed());
    }

    println!();
    for kind in LeafKind::ALL {
        let len = store.len(kind)?;
        let count = if len == 0 {
            len.to_string().dimmed()
        } else {
            len.to_string().bold()
        };
        println!("  {:<24} {}", kind.as_str(), count);
    }
    Ok(())
}

fn cmd_put(config: &StoreConfig, args: PutArgs) -> anyhow::Result<()> {
    let kind = kind(&args.kind)?;
    let record = fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;

    let store = open(config)?;
    let mut tree = store.mutable_tree();
    let stored = tree
        .leaf(kind)
        .and_then(|mut leaf| leaf.store(&args.id, &record, args.alias.as_deref()));
    let changed = match stored {
        Ok(changed) => changed,
        Err(e) => {
            tree.abort();
            return Err(e.into());
        }
    };
    tree.commit()?;

    let revision = store.revision(kind, &args.id)?.unwrap_or_default();
    let hash = store.hash(kind, &args.id)?.unwrap_or_default();
    if changed {
        println!(
            "{} Stored {}/{} (rev {}, {})",
            "✓".green().bold(),
            kind,
            args.id.bold(),
            revision,
            hash.short_hex().yellow()
        );
    } else {
        println!("{} {}/{} unchanged", "✓".green(), kind, args.id.bold());
    }
    Ok(())
}

fn cmd_get(config: &StoreConfig, args: GetArgs) -> anyhow::Result<()> {
    let kind = kind(&args.kind)?;
    let store = open(config)?;
    let Some(record) = store.load(kind, &args.id, true)? else {
        bail!("{kind}/{} not found", args.id);
    };
    match args.output {
        Some(path) => {
            fs::write(&path, &record).with_context(|| format!("writing {}", path.display()))?;
            println!(
                "{} Wrote {} bytes to {}",
                "✓".green().bold(),
                record.len(),
                path.display()
            );
        }
        None => io::stdout().write_all(&record)?,
    }
    Ok(())
}

fn cmd_ls(config: &StoreConfig, args: LsArgs) -> anyhow::Result<()> {
    let kind = kind(&args.kind)?;
    let store = open(config)?;
    let index = store.index(kind)?;
    if index.is_empty() {
        println!("No {kind}.");
        return Ok(());
    }
    for (id, entry) in index.entries() {
        let alias = if entry.alias.is_empty() {
            String::new()
        } else {
            format!(" ({})", entry.alias)
        };
        println!(
            "{}  {}{}  {}",
            entry.hash.short_hex().yellow(),
            id.bold(),
            alias.cyan(),
            format!("rev {}", entry.revision).dimmed()
        );
    }
    Ok(())
}

fn cmd_alias(config: &StoreConfig, args: AliasArgs) -> anyhow::Result<()> {
    let kind = kind(&args.kind)?;
    let store = open(config)?;
    let mut tree = store.mutable_tree();
    let renamed = tree
        .leaf(kind)
        .and_then(|mut leaf| leaf.set_alias(&args.id, &args.alias));
    if let Err(e) = renamed {
        tree.abort();
        return Err(e.into());
    }
    tree.commit()?;
    println!(
        "{} {}/{} is now {}",
        "✓".green().bold(),
        kind,
        args.id.bold(),
        args.alias.cyan()
    );
    Ok(())
}

fn cmd_rm(config: &StoreConfig, args: RmArgs) -> anyhow::Result<()> {
    let kind = kind(&args.kind)?;
    let store = open(config)?;
    let mut tree = store.mutable_tree();
    let removed = tree.leaf(kind).map(|mut leaf| leaf.delete(&args.id));
    let removed = match removed {
        Ok(removed) => removed,
        Err(e) => {
            tree.abort();
            return Err(e.into());
        }
    };
    if !removed {
        tree.abort();
        bail!("{kind}/{} not found", args.id);
    }
    tree.commit()?;
    println!("{} Removed {}/{}", "✓".green().bold(), kind, args.id.bold());
    Ok(())
}

fn cmd_gc(config: &StoreConfig) -> anyhow::Result<()> {
    let store = open(config)?;
    let report = store.collect_garbage()?;
    println!(
        "{} GC: {} copied, {} already present, bucket {} → {} in {:?}",
        "✓".green().bold(),
        report.copied.to_string().bold(),
        report.skipped,
        report.from,
        report.to.to_string().green(),
        report.elapsed
    );
    Ok(())
}

fn cmd_migrate(config: &mut StoreConfig, args: MigrateArgs) -> anyhow::Result<()> {
    let target: BackendKind = args.to.parse()?;

    if let Some(path) = args.path {
        let store = open(config)?;
        let driver = target.open(&path)?;
        let report = store.migrate(driver)?;
        print_migration(&report);
        return Ok(());
    }

    if !target.is_persistent() {
        bail!("the primary backend must be persistent; use --path to copy into memory");
    }
    if recorded_backend(config)? == Some(target) {
        println!("Primary is already {}.", target.to_string().cyan());
        return Ok(());
    }
    config.primary = target;
    let store = open(config)?;
    match store.startup_migration() {
        Some(report) => print_migration(report),
        None => println!(
            "{} Primary set to {} (nothing to migrate)",
            "✓".green().bold(),
            target.to_string().cyan()
        ),
    }
    println!(
        "  Set {} in your configuration to keep using it.",
        format!("primary = \"{target}\"").bold()
    );
    Ok(())
}

fn print_migration(report: &MigrationReport) {
    println!(
        "{} Migrated {} → {}: {} copied, {} already present",
        "✓".green().bold(),
        report.from.dimmed(),
        report.to.cyan(),
        report.copied.to_string().bold(),
        report.skipped
    );
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}
