use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cask",
    about = "cask — content-addressed, garbage-collected record store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show root, buckets and leaf sizes
    Status(StatusArgs),
    /// Store a record under a logical id
    Put(PutArgs),
    /// Print or export a record
    Get(GetArgs),
    /// List the ids in a leaf
    Ls(LsArgs),
    /// Rename a record
    Alias(AliasArgs),
    /// Remove a logical id from its leaf
    Rm(RmArgs),
    /// Run a garbage collection pass now
    Gc(GcArgs),
    /// Move the live snapshot to another backend
    Migrate(MigrateArgs),
}

#[derive(Args)]
pub struct StatusArgs {}

#[derive(Args)]
pub struct PutArgs {
    /// Leaf kind (credentials, units, seeds, ...)
    pub kind: String,
    pub id: String,
    /// File holding the record bytes
    pub file: PathBuf,
    #[arg(short, long)]
    pub alias: Option<String>,
}

#[derive(Args)]
pub struct GetArgs {
    pub kind: String,
    pub id: String,
    /// Write the record here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct LsArgs {
    pub kind: String,
}

#[derive(Args)]
pub struct AliasArgs {
    pub kind: String,
    pub id: String,
    pub alias: String,
}

#[derive(Args)]
pub struct RmArgs {
    pub kind: String,
    pub id: String,
}

#[derive(Args)]
pub struct GcArgs {}

#[derive(Args)]
pub struct MigrateArgs {
    /// Target backend: fs, sqlite or memory
    #[arg(long)]
    pub to: String,
    /// Copy into a driver at this path instead of switching the primary
    #[arg(long)]
    pub path: Option<PathBuf>,
}
