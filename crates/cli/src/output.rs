//! Output formatting for reports, jobs and plugins

use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use arca_common::{IndexResult, Job, PluginInfo, PluginState, Report};

/// Print a run report in the specified format
pub fn print_report(report: &Report, format: &str, duration: Duration) -> Result<()> {
    let format = format.trim().to_lowercase();
    match format.as_str() {
        "json" | "j" => print_report_json(report, duration)?,
        "csv" | "c" => print_report_csv(report),
        "table" | "text" | "t" | "" => print_report_table(report, duration),
        _ => {
            eprintln!("Warning: Unknown format '{}', using default table format", format);
            print_report_table(report, duration);
        }
    }
    Ok(())
}

/// Print items as an ASCII table, failures first
fn print_report_table(report: &Report, duration: Duration) {
    if report.items.is_empty() {
        println!("\nNo objects were processed.\n");
    } else {
        let mut items: Vec<_> = report.items.iter().collect();
        items.sort_by_key(|i| (state_rank(i.state), i.object.kind, i.object.id.clone()));

        println!("\n{:-<80}", "");
        println!(
            "{:<22} {:<24} {:<16} {:<16}",
            "KIND", "ID", "STATE", "DETAILS"
        );
        println!("{:-<80}", "");
        for item in items {
            println!(
                "{:<22} {:<24} {:<16} {}",
                item.object.kind.to_string(),
                truncate(&item.object.id, 24),
                item.state.to_string(),
                truncate(&item.details, 40)
            );
        }
        println!("{:-<80}", "");
    }

    let counts = report.counts();
    println!("\nSummary:");
    println!("  Job: {} ({})", report.job_id, report.plugin_id);
    println!("  Outcome: {}", report.overall_state());
    println!("  Batches: {}", report.batches);
    println!("  Success: {}", counts.success);
    println!("  Partial success: {}", counts.partial_success);
    println!("  Failure: {}", counts.failure);
    println!("  Skipped: {}", counts.skipped);
    if report.lost_batches > 0 {
        println!("  Lost batches: {}", report.lost_batches);
    }
    if report.partial {
        println!("  Partial report: not every batch completed");
    }
    for error in &report.errors {
        println!("  Error [{}]: {}", error.kind, error.message);
    }
    println!("  Duration: {}", format_duration(duration));
    println!();
}

/// Print the whole report as JSON
fn print_report_json(report: &Report, duration: Duration) -> Result<()> {
    let counts = report.counts();
    let output = json!({
        "run_info": {
            "duration_seconds": duration.as_secs_f64(),
            "duration_formatted": format_duration(duration),
            "outcome": report.overall_state(),
            "counts": counts,
        },
        "report": report,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_report_csv(report: &Report) {
    println!("kind,id,state,error_kind,details");
    for item in &report.items {
        let error_kind = item.error.as_ref().map(|e| e.kind.as_str()).unwrap_or("");
        println!(
            "{},{},{},{},{}",
            item.object.kind,
            csv_field(&item.object.id),
            item.state,
            error_kind,
            csv_field(&item.details)
        );
    }
}

/// Print one job record
pub fn print_job(job: &Job, format: &str) -> Result<()> {
    if format.trim().eq_ignore_ascii_case("json") {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }
    println!("\nJob {}", job.id);
    println!("  Name: {}", job.name);
    println!("  Plugin: {}", job.plugin);
    println!("  Method: {}", job.orchestrator_method);
    println!("  Status: {}", job.status);
    println!("  Completion: {}%", job.completion_percentage);
    println!("  Created: {}", job.created_at.to_rfc3339());
    println!("  Updated: {}", job.updated_at.to_rfc3339());
    println!();
    Ok(())
}

/// Print a page of job records
pub fn print_jobs(page: &IndexResult<Job>, format: &str) -> Result<()> {
    match format.trim().to_lowercase().as_str() {
        "json" | "j" => println!("{}", serde_json::to_string_pretty(page)?),
        "csv" | "c" => {
            println!("id,name,plugin,status,completion,created_at");
            for job in &page.results {
                println!(
                    "{},{},{},{},{},{}",
                    csv_field(&job.id),
                    csv_field(&job.name),
                    csv_field(&job.plugin),
                    job.status,
                    job.completion_percentage,
                    job.created_at.to_rfc3339()
                );
            }
        }
        _ => {
            if page.results.is_empty() {
                println!("\nNo jobs found.\n");
                return Ok(());
            }
            println!("\n{:-<80}", "");
            println!(
                "{:<38} {:<16} {:<11} {:>5}  {}",
                "ID", "PLUGIN", "STATUS", "PCT", "CREATED"
            );
            println!("{:-<80}", "");
            for job in &page.results {
                println!(
                    "{:<38} {:<16} {:<11} {:>4}%  {}",
                    truncate(&job.id, 38),
                    truncate(&job.plugin, 16),
                    job.status.to_string(),
                    job.completion_percentage,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("{:-<80}", "");
            println!(
                "Showing {} of {} job(s) from offset {}\n",
                page.results.len(),
                page.total_count,
                page.offset
            );
        }
    }
    Ok(())
}

/// Print registered plugins
pub fn print_plugins(plugins: &[PluginInfo], format: &str) -> Result<()> {
    if format.trim().eq_ignore_ascii_case("json") {
        println!("{}", serde_json::to_string_pretty(plugins)?);
        return Ok(());
    }
    for plugin in plugins {
        let kinds: Vec<String> = plugin.object_kinds.iter().map(|k| k.to_string()).collect();
        println!(
            "{:<16} {:<8} [{}] {}",
            plugin.id,
            plugin.version,
            kinds.join(", "),
            plugin.description
        );
    }
    Ok(())
}

fn state_rank(state: PluginState) -> u8 {
    match state {
        PluginState::Failure => 0,
        PluginState::PartialSuccess => 1,
        PluginState::Skipped => 2,
        PluginState::Success => 3,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        s.to_string()
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\"").replace(['\n', '\r'], " "))
    } else {
        s.to_string()
    }
}

/// Format duration in a human-readable way
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        format!("{}ms", millis)
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}.{:03}s", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}
