//! `stowdb` operator CLI.
//!
//! # Responsibility
//! - Drive `stowdb_core` from a shell: migrate, inspect, query, and execute.
//! - Map core errors to a non-zero exit status with a one-line message.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, GlobalArgs, StatementArgs};
use log::info;
use std::process::ExitCode;
use stowdb_core::db::{open_db, DbHandle};
use stowdb_core::{
    default_log_level, init_logging, load_migrations_dir, Database, DatabaseConfig, MigrationRunner,
    MigrationStep, SqlValue,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(message) = setup_logging(&cli.global) {
        eprintln!("error: {message}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = DatabaseConfig::new(&cli.global.dir, cli.global.name.as_str());
    let steps = load_steps(&cli.global)?;

    match cli.command {
        Commands::Status => print_status(&config, steps),
        Commands::Migrate => {
            let database = initialize(&config, steps)?;
            let report = database
                .migration_report()
                .ok_or_else(|| "database is not ready".to_string())?;
            println!(
                "migrated {} -> {} (applied: {:?})",
                report.from_version, report.to_version, report.applied
            );
            close(&database)
        }
        Commands::Query(args) => {
            let database = initialize(&config, steps)?;
            let rows = database
                .execute_query(&args.sql, &parse_params(&args))
                .map_err(|err| err.to_string())?;
            let json = serde_json::to_string_pretty(&rows).map_err(|err| err.to_string())?;
            println!("{json}");
            close(&database)
        }
        Commands::Exec(args) => {
            let database = initialize(&config, steps)?;
            let changed = database
                .try_execute_update(&args.sql, &parse_params(&args))
                .map_err(|err| err.to_string())?;
            println!("{changed} row(s) changed");
            close(&database)
        }
    }
}

fn setup_logging(global: &GlobalArgs) -> Result<(), String> {
    let Some(log_dir) = global.log_dir.as_deref() else {
        return Ok(());
    };
    let level = global
        .log_level
        .clone()
        .unwrap_or_else(|| default_log_level().as_str().to_string());
    init_logging(&level, log_dir).map_err(|err| err.to_string())
}

fn load_steps(global: &GlobalArgs) -> Result<Vec<MigrationStep>, String> {
    match &global.migrations {
        Some(dir) => load_migrations_dir(dir).map_err(|err| err.to_string()),
        None => Ok(Vec::new()),
    }
}

fn initialize(config: &DatabaseConfig, steps: Vec<MigrationStep>) -> Result<Database, String> {
    let database = Database::new();
    database
        .initialize(config, steps)
        .map_err(|err| err.to_string())?;
    info!("event=cli_ready module=cli status=ok");
    Ok(database)
}

fn close(database: &Database) -> Result<(), String> {
    database.close().map_err(|err| err.to_string())
}

/// Read-only: never creates the directory or the database file.
fn print_status(config: &DatabaseConfig, steps: Vec<MigrationStep>) -> Result<(), String> {
    let runner = MigrationRunner::new(steps).map_err(|err| err.to_string())?;
    let path = config.full_path();
    if !path.is_file() {
        return Err(format!("database `{}` does not exist", path.display()));
    }
    let config = DatabaseConfig {
        create_dirs: false,
        ..config.clone()
    };
    let handle: DbHandle = open_db(&config).map_err(|err| err.to_string())?;
    let status = runner.status(&handle).map_err(|err| err.to_string())?;

    println!("database: {}", config.full_path().display());
    println!("current version: {}", status.current_version);
    println!("latest version:  {}", status.latest_version);
    println!("applied: {:?}", status.applied);
    println!("pending: {:?}", status.pending);
    handle.close().map_err(|err| err.to_string())
}

fn parse_params(args: &StatementArgs) -> Vec<SqlValue> {
    args.params.iter().map(|raw| parse_param(raw)).collect()
}

fn parse_param(raw: &str) -> SqlValue {
    if let Ok(value) = raw.parse::<i64>() {
        return SqlValue::Integer(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return SqlValue::Real(value);
    }
    if raw.eq_ignore_ascii_case("null") {
        return SqlValue::Null;
    }
    SqlValue::Text(raw.to_string())
}
