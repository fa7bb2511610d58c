// runner.rs
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use arca_common::{
    Collaborators, Filter, JobFilter, JobRequest, JobSort, JobStatus, JobStore, ObjectKind,
    ObjectSelector, OrchestratorConfig, OrchestratorMethod, PluginParameters, PluginRegistry,
    Sublist,
};
use arca_orchestrator::Orchestrator;
use arca_plugin_host::PluginManager;
use arca_storage::{MemoryJobStore, MemoryRepository, SqliteJobStore};

use crate::output::{print_job, print_jobs, print_plugins, print_report};

/// How often `submit` polls the job store.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub repository: PathBuf,
    pub plugin: String,
    pub params: Vec<String>,
    pub kind: String,
    pub ids: Option<String>,
    pub filter: Vec<String>,
    pub all: bool,
    pub workers: Option<usize>,
    pub block_size: Option<usize>,
    pub output_format: String,
}

pub async fn run_plugin(opts: RunOptions) -> Result<()> {
    let config = load_config(opts.config.as_deref(), opts.workers, opts.block_size)?;
    let kind: ObjectKind = opts.kind.parse()?;
    let parameters = parse_params(&opts.params)?;
    let selector = build_selector(kind, opts.ids.as_deref(), &opts.filter, opts.all)?;
    let method = method_for(&selector)?;
    let mut request = JobRequest::new(opts.plugin.as_str(), method, selector);
    request.plugin_parameters = parameters;

    info!("Plugin: {}", opts.plugin);
    info!("Method: {}", method);
    info!(
        "Workers: {}, block size: {}",
        config.worker_count, config.block_size
    );

    let orchestrator = build_orchestrator(
        config,
        &opts.repository,
        Arc::new(MemoryJobStore::new()),
    )?;
    let started = Instant::now();
    let result = orchestrator.run(request).await;
    let elapsed = started.elapsed();
    orchestrator.shutdown().await;

    let report = result?;
    if report.partial {
        warn!("Report is partial: some batches did not complete");
    }
    print_report(&report, &opts.output_format, elapsed)?;
    Ok(())
}

pub async fn submit_job(
    config: Option<PathBuf>,
    repository: PathBuf,
    job_path: PathBuf,
    db: Option<String>,
    output_format: String,
) -> Result<()> {
    let config = load_config(config.as_deref(), None, None)?;
    let raw = std::fs::read_to_string(&job_path)
        .with_context(|| format!("Failed to read job request {}", job_path.display()))?;
    let request: JobRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid job request {}", job_path.display()))?;

    let store = open_store(db.as_deref()).await?;
    let orchestrator = build_orchestrator(config, &repository, store)?;
    let job_id = orchestrator.submit(request).await?;
    info!("Submitted job {}", job_id);

    let job = loop {
        let job = orchestrator.retrieve_job(&job_id).await?;
        if job.status.is_terminal() {
            break job;
        }
        let pct = orchestrator.progress(&job_id).await.unwrap_or(0.0);
        info!("Job {} {}: {:.1}%", job_id, job.status, pct);
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    orchestrator.shutdown().await;

    print_job(&job, &output_format)?;
    if job.status != JobStatus::Completed {
        bail!("job {} ended {}", job.id, job.status);
    }
    Ok(())
}

pub async fn list_jobs(
    db: String,
    status: Option<String>,
    plugin: Option<String>,
    limit: usize,
    offset: usize,
    output_format: String,
) -> Result<()> {
    let store = SqliteJobStore::connect(&db)
        .await
        .with_context(|| format!("Failed to open job database {db}"))?;
    let filter = JobFilter {
        status: status.as_deref().map(str::parse).transpose()?,
        plugin,
        username: None,
    };
    let page = store
        .find(&filter, JobSort::CreatedDesc, Sublist::new(offset, limit))
        .await?;
    print_jobs(&page, &output_format)
}

pub fn list_plugins(output_format: &str) -> Result<()> {
    let plugins = PluginManager::with_builtins().list();
    print_plugins(&plugins, output_format)
}

/// Config file (if any), then environment, then flags.
fn load_config(
    path: Option<&Path>,
    workers: Option<usize>,
    block_size: Option<usize>,
) -> Result<OrchestratorConfig> {
    let mut config = match path {
        Some(p) => OrchestratorConfig::load(p)?,
        None => OrchestratorConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(n) = workers {
        config = config.with_workers(n);
    }
    if let Some(n) = block_size {
        config = config.with_block_size(n);
    }
    config.validate()?;
    Ok(config)
}

async fn open_store(db: Option<&str>) -> Result<Arc<dyn JobStore>> {
    match db {
        Some(url) => {
            let store = SqliteJobStore::connect(url)
                .await
                .with_context(|| format!("Failed to open job database {url}"))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryJobStore::new())),
    }
}

fn build_orchestrator(
    config: OrchestratorConfig,
    repository: &Path,
    store: Arc<dyn JobStore>,
) -> Result<Orchestrator> {
    let repository = Arc::new(
        MemoryRepository::load(repository)
            .with_context(|| format!("Failed to load repository {}", repository.display()))?,
    );
    let collaborators = Collaborators::new(repository.clone(), repository);
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(PluginManager::with_builtins()),
        collaborators,
        store,
    )?;
    Ok(orchestrator)
}

/// Parses repeated `key=value` arguments into plugin parameters
fn parse_params(raw: &[String]) -> Result<PluginParameters> {
    let mut params = PluginParameters::new();
    for part in raw {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid parameter '{}': expected key=value", part))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid parameter '{}': empty key", part);
        }
        params.insert(key.to_string(), value.trim().to_string());
    }
    Ok(params)
}

fn parse_filter(raw: &[String]) -> Result<Filter> {
    let mut filter = Filter::all();
    for term in raw {
        let (field, value) = term
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid filter '{}': expected field=value", term))?;
        filter = filter.with_term(field.trim(), value.trim());
    }
    Ok(filter)
}

fn build_selector(
    kind: ObjectKind,
    ids: Option<&str>,
    filter: &[String],
    all: bool,
) -> Result<ObjectSelector> {
    if let Some(ids) = ids {
        let ids: Vec<String> = ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if ids.is_empty() {
            bail!("No ids specified");
        }
        return Ok(ObjectSelector::ids(kind, ids));
    }
    if !filter.is_empty() {
        return Ok(ObjectSelector::query(kind, parse_filter(filter)?));
    }
    if all {
        // resources have no list-all method; an empty index query selects them all
        if kind == ObjectKind::TransferredResource {
            return Ok(ObjectSelector::query(kind, Filter::all()));
        }
        return Ok(ObjectSelector::all(kind));
    }
    bail!("One of --ids, --filter or --all is required")
}

fn method_for(selector: &ObjectSelector) -> Result<OrchestratorMethod> {
    OrchestratorMethod::ALL
        .into_iter()
        .find(|m| m.accepts(selector))
        .ok_or_else(|| match selector.kind() {
            Some(kind) => anyhow!("No orchestrator method runs on explicit {} ids", kind),
            None => anyhow!("No orchestrator method accepts this selector"),
        })
}
