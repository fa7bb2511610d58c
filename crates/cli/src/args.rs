use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arca")]
#[command(version = "0.1.0")]
#[command(about = "Runs repository plugins in parallel batches", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log format: compact or json
    #[arg(long, default_value = "compact", global = true)]
    pub log_format: String,

    /// Orchestrator configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a plugin inline and print its report
    #[command(group(ArgGroup::new("selection").required(true).args(["ids", "filter", "all"])))]
    Run {
        /// Repository fixture (JSON)
        #[arg(short, long)]
        repository: PathBuf,

        /// Plugin id
        #[arg(short, long)]
        plugin: String,

        /// Plugin parameter as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,

        /// Object kind: aip, representation, file, transferred_resource
        #[arg(short, long, default_value = "aip")]
        kind: String,

        /// Comma separated object ids
        #[arg(long)]
        ids: Option<String>,

        /// Index filter term as field=value (repeatable)
        #[arg(long)]
        filter: Vec<String>,

        /// Every object of the kind
        #[arg(long)]
        all: bool,

        /// Item worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Objects per batch
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Output format: text, json, csv
        #[arg(short, long, default_value = "text")]
        output_format: String,
    },

    /// Store a job, run it on the job pool and wait for it to finish
    Submit {
        /// Repository fixture (JSON)
        #[arg(short, long)]
        repository: PathBuf,

        /// Job request (JSON)
        #[arg(short, long)]
        job: PathBuf,

        /// Job database URL, e.g. sqlite://jobs.db (in-memory when omitted)
        #[arg(long)]
        db: Option<String>,

        /// Output format: text, json
        #[arg(short, long, default_value = "text")]
        output_format: String,
    },

    /// List stored jobs
    Jobs {
        /// Job database URL
        #[arg(long, required = true)]
        db: String,

        /// Only jobs in this status
        #[arg(long)]
        status: Option<String>,

        /// Only jobs of this plugin
        #[arg(long)]
        plugin: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Output format: text, json, csv
        #[arg(short, long, default_value = "text")]
        output_format: String,
    },

    /// List registered plugins
    Plugins {
        /// Output format: text, json
        #[arg(short, long, default_value = "text")]
        output_format: String,
    },
}
