mod args;
mod output;
mod runner;

use anyhow::Result;
use clap::Parser;
use arca_telemetry::{init_logging, LogFormat};

use args::{Cli, Commands};
use runner::{list_jobs, list_plugins, run_plugin, submit_job, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: LogFormat = cli.log_format.parse()?;
    init_logging(cli.verbose, log_format)?;

    match cli.command {
        Commands::Run {
            repository,
            plugin,
            params,
            kind,
            ids,
            filter,
            all,
            workers,
            block_size,
            output_format,
        } => {
            run_plugin(RunOptions {
                config: cli.config,
                repository,
                plugin,
                params,
                kind,
                ids,
                filter,
                all,
                workers,
                block_size,
                output_format,
            })
            .await?;
        }
        Commands::Submit {
            repository,
            job,
            db,
            output_format,
        } => {
            submit_job(cli.config, repository, job, db, output_format).await?;
        }
        Commands::Jobs {
            db,
            status,
            plugin,
            limit,
            offset,
            output_format,
        } => {
            list_jobs(db, status, plugin, limit, offset, output_format).await?;
        }
        Commands::Plugins { output_format } => {
            list_plugins(&output_format)?;
        }
    }

    Ok(())
}
