//! SQLite-backed job store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

use arca_common::{
    ArcaError, ArcaResult, IndexResult, Job, JobFilter, JobSort, JobStatus, JobStore, Sublist,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    plugin TEXT NOT NULL,
    plugin_parameters TEXT NOT NULL,
    orchestrator_method TEXT NOT NULL,
    selector TEXT NOT NULL,
    username TEXT NOT NULL,
    status TEXT NOT NULL,
    completion_percentage INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const SELECT_COLUMNS: &str = "SELECT id, name, plugin, plugin_parameters, orchestrator_method, \
     selector, username, status, completion_percentage, created_at, updated_at FROM jobs";

fn storage_err(e: sqlx::Error) -> ArcaError {
    ArcaError::Storage(e.to_string())
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> ArcaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ArcaError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn row_to_job(row: &SqliteRow) -> ArcaResult<Job> {
    let get = |col: &str| -> ArcaResult<String> { row.try_get::<String, _>(col).map_err(storage_err) };
    let method: String = get("orchestrator_method")?;
    let percentage: i64 = row
        .try_get("completion_percentage")
        .map_err(storage_err)?;
    Ok(Job {
        id: get("id")?,
        name: get("name")?,
        plugin: get("plugin")?,
        plugin_parameters: serde_json::from_str(&get("plugin_parameters")?)?,
        orchestrator_method: method.parse()?,
        selector: serde_json::from_str(&get("selector")?)?,
        username: get("username")?,
        status: JobStatus::from_str(&get("status")?)?,
        completion_percentage: u8::try_from(percentage.clamp(0, 100)).unwrap_or(100),
        created_at: decode_time(&get("created_at")?)?,
        updated_at: decode_time(&get("updated_at")?)?,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Connect to `url` (e.g. `sqlite::memory:` or `sqlite://jobs.db`),
    /// creating the database and schema when missing.
    pub async fn connect(url: &str) -> ArcaResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage_err)?
            .create_if_missing(true);
        // An in-memory database lives and dies with its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.migrate().await?;
        debug!("Connected job store at {}", url);
        Ok(store)
    }

    async fn migrate(&self) -> ArcaResult<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn where_clause(filter: &JobFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(plugin) = &filter.plugin {
            clauses.push("plugin = ?");
            binds.push(plugin.clone());
        }
        if let Some(username) = &filter.username {
            clauses.push("username = ?");
            binds.push(username.clone());
        }
        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), binds)
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job = %job.id))]
    async fn create(&self, job: Job) -> ArcaResult<Job> {
        sqlx::query(
            "INSERT INTO jobs (id, name, plugin, plugin_parameters, orchestrator_method, selector, \
             username, status, completion_percentage, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.plugin)
        .bind(serde_json::to_string(&job.plugin_parameters)?)
        .bind(job.orchestrator_method.as_str())
        .bind(serde_json::to_string(&job.selector)?)
        .bind(&job.username)
        .bind(job.status.as_str())
        .bind(i64::from(job.completion_percentage))
        .bind(encode_time(&job.created_at))
        .bind(encode_time(&job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(job)
    }

    async fn retrieve(&self, job_id: &str) -> ArcaResult<Job> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(ArcaError::JobNotFound(job_id.to_string())),
        }
    }

    async fn find(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<Job>> {
        let (where_sql, binds) = Self::where_clause(filter);

        let count_sql = format!("SELECT COUNT(*) AS n FROM jobs{where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;

        let order = match sort {
            JobSort::CreatedAsc => "created_at ASC, id ASC",
            JobSort::CreatedDesc => "created_at DESC, id DESC",
        };
        let page_sql = format!("{SELECT_COLUMNS}{where_sql} ORDER BY {order} LIMIT ? OFFSET ?");
        let mut page_query = sqlx::query(&page_sql);
        for b in &binds {
            page_query = page_query.bind(b);
        }
        let rows = page_query
            .bind(i64::try_from(sublist.limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(sublist.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let results = rows.iter().map(row_to_job).collect::<ArcaResult<Vec<_>>>()?;
        Ok(IndexResult {
            offset: sublist.offset,
            limit: sublist.limit,
            total_count: usize::try_from(total).unwrap_or(0),
            results,
        })
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        completion_percentage: u8,
    ) -> ArcaResult<Job> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ArcaError::JobNotFound(job_id.to_string()))?;
        let mut job = row_to_job(&row)?;
        if job.status != status {
            job.transition_to(status)?;
        }
        job.completion_percentage = completion_percentage.min(100);
        job.updated_at = Utc::now();

        sqlx::query(
            "UPDATE jobs SET status = ?, completion_percentage = ?, updated_at = ? WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.completion_percentage))
        .bind(encode_time(&job.updated_at))
        .bind(&job.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(job)
    }
}
