//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// stowdb - open, migrate, and query an embedded SQLite database
#[derive(Parser, Debug)]
#[command(name = "stowdb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the database file
    #[arg(short, long, global = true, default_value = ".")]
    pub dir: PathBuf,

    /// Database file name
    #[arg(short, long, global = true, default_value = "stow.sqlite3")]
    pub name: String,

    /// Migration directory of `<version>_<name>.sql` files
    #[arg(short, long, global = true)]
    pub migrations: Option<PathBuf>,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Absolute directory for rolling log files; logging is off when unset
    #[arg(long, global = true)]
    pub log_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending migrations and print the resulting version
    Migrate,

    /// Show applied and pending migration versions without changing anything
    Status,

    /// Run a read statement and print rows as JSON
    Query(StatementArgs),

    /// Run a single non-query statement
    Exec(StatementArgs),
}

#[derive(Args, Debug)]
pub struct StatementArgs {
    /// SQL text with `?` placeholders
    pub sql: String,

    /// Positional parameters: integers, reals, `null`, anything else is text
    pub params: Vec<String>,
}
