use anyhow::Context;
use branchdump::cli::{broker_options, Cli, Command, RestoreArgs};
use branchdump::{logging, Orchestrator, RestoreOutcome, Settings};
use branchdump_broker::{CredentialBroker, HttpManagementApi};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    logging::init(cli.debug, cli.log_format)?;

    let settings = match &cli.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    match &cli.command {
        Command::RestoreDump(args) => restore_dump(&cli, args, &settings).await,
    }
}

async fn restore_dump(cli: &Cli, args: &RestoreArgs, settings: &Settings) -> Result<ExitCode, anyhow::Error> {
    let organization = cli.organization(&settings.api)?;
    let api = HttpManagementApi::new(cli.api_config(&settings.api)?)?;
    let broker = Arc::new(CredentialBroker::new(Arc::new(api), broker_options(&settings.restore)));
    let request = args.request(organization, &settings.restore);
    let branch = request.branch.clone();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping after the current statements");
                on_signal.cancel();
            }
            Err(err) => warn!("unable to listen for shutdown signal: {}", err),
        }
    });

    if let Some(dir) = &args.dir {
        println!("Starting to restore database {} from {}", branch, dir.display());
    }
    let outcome = Orchestrator::new(broker, request).run(cancel).await;
    print_outcome(&outcome);
    Ok(ExitCode::from(outcome.exit_code() as u8))
}

fn print_outcome(outcome: &RestoreOutcome) {
    match &outcome.result {
        Ok(summary) => {
            println!(
                "Finished restoring {} tables in {:.2}s ({} statements)",
                summary.tables_restored.len(),
                summary.elapsed.as_secs_f64(),
                summary.statements
            );
            if !summary.views_restored.is_empty() {
                println!("Restored {} views", summary.views_restored.len());
            }
            let failures = summary.failed_tables.iter().chain(&summary.failed_views);
            for (i, failure) in failures.enumerate() {
                if i == 0 {
                    println!("The following objects failed to restore:");
                }
                println!("  {}", failure);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(hint) = e.hint() {
                eprintln!("  {}", hint);
            }
        }
    }
    if outcome.credential_revoked == Some(false) {
        eprintln!("Warning: the restore credential could not be revoked; it expires on its own");
    }
}
