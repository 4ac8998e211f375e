//! CLI command implementations

use crate::output::{ellipsize, format_bytes, format_speed, print_json};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use linkrelay_core::{
    ceiling_from_signed, status, HistoryDatabase, RejectionReason, RelayCore, RelayError,
    Storage, TaskHandle,
};
use linkrelay_types::{Settings, TaskSnapshot, TaskStatus, TransferReceipt, UserId, UserStats};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

// ============================================================================
// Transfer Commands
// ============================================================================

/// What happened to one submitted URL
#[derive(Debug, Serialize)]
struct Outcome {
    user_id: String,
    url: String,
    task_id: Option<String>,
    status: &'static str,
    artifact_name: Option<String>,
    bytes: Option<u64>,
    share_link: Option<String>,
    error: Option<String>,
}

impl Outcome {
    fn rejected(user: &UserId, url: &str, reason: &RejectionReason) -> Self {
        let error = match reason {
            RejectionReason::LimitReached { active, limit } => status::limit_reached(*active, *limit),
            RejectionReason::NotAuthenticated => status::not_authenticated().to_string(),
            other => other.to_string(),
        };
        Self {
            user_id: user.to_string(),
            url: url.to_string(),
            task_id: None,
            status: "rejected",
            artifact_name: None,
            bytes: None,
            share_link: None,
            error: Some(error),
        }
    }

    fn finished(
        user: &UserId,
        url: &str,
        task_id: String,
        artifact_name: String,
        result: Result<TransferReceipt, RelayError>,
    ) -> Self {
        let mut outcome = Self {
            user_id: user.to_string(),
            url: url.to_string(),
            task_id: Some(task_id),
            status: TaskStatus::Completed.as_str(),
            artifact_name: Some(artifact_name),
            bytes: None,
            share_link: None,
            error: None,
        };
        match result {
            Ok(receipt) => {
                outcome.bytes = Some(receipt.bytes);
                outcome.share_link = Some(receipt.object.share_link);
            }
            Err(e) => {
                outcome.status = TaskStatus::Failed.as_str();
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed.as_str()
    }
}

struct Submitted {
    url: String,
    handle: TaskHandle,
}

async fn submit_one(
    core: &RelayCore,
    user: &UserId,
    url: &str,
    submitted: &mut Vec<Submitted>,
    outcomes: &mut Vec<Outcome>,
    format: OutputFormat,
) {
    match core.submit(user.clone(), url).await {
        Ok(handle) => submitted.push(Submitted {
            url: url.to_string(),
            handle,
        }),
        Err(reason) => {
            let outcome = Outcome::rejected(user, url, &reason);
            if matches!(format, OutputFormat::Human) {
                eprintln!(
                    "{} {}: {}",
                    style("✗").red().bold(),
                    url,
                    outcome.error.as_deref().unwrap_or_default()
                );
            }
            outcomes.push(outcome);
        }
    }
}

async fn wait_all(submitted: Vec<Submitted>, outcomes: &mut Vec<Outcome>) {
    for Submitted { url, handle } in submitted {
        let user = handle.user_id.clone();
        let task_id = handle.task_id.to_string();
        let artifact_name = handle.artifact_name.clone();
        let result = handle.wait().await;
        outcomes.push(Outcome::finished(&user, &url, task_id, artifact_name, result));
    }
}

pub async fn fetch(
    core: &RelayCore,
    user: &str,
    urls: Vec<String>,
    format: OutputFormat,
) -> Result<()> {
    let user = UserId::from(user);
    let progress = matches!(format, OutputFormat::Human).then(|| TransferProgress::start(core.subscribe()));

    let mut submitted = Vec::new();
    let mut outcomes = Vec::new();
    for url in &urls {
        submit_one(core, &user, url, &mut submitted, &mut outcomes, format).await;
    }

    wait_all(submitted, &mut outcomes).await;
    if let Some(progress) = progress {
        progress.finish().await;
    }
    core.shutdown().await;

    report(&outcomes, format)
}

pub async fn batch(core: &RelayCore, file: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let requests = match file {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Cannot open {}", path.display()))?;
            read_requests(file).await?
        }
        None => read_requests(tokio::io::stdin()).await?,
    };

    if requests.is_empty() {
        bail!("No `<user> <url>` lines to submit");
    }

    let progress = matches!(format, OutputFormat::Human).then(|| TransferProgress::start(core.subscribe()));

    // Submit everything first; admission decides what runs
    let mut submitted = Vec::new();
    let mut outcomes = Vec::new();
    for (user, url) in &requests {
        submit_one(core, user, url, &mut submitted, &mut outcomes, format).await;
    }

    wait_all(submitted, &mut outcomes).await;
    if let Some(progress) = progress {
        progress.finish().await;
    }
    core.shutdown().await;

    report(&outcomes, format)
}

/// Parse `<user> <url>` lines; blank lines and `#` comments are skipped
async fn read_requests<R: AsyncRead + Unpin>(input: R) -> Result<Vec<(UserId, String)>> {
    let mut lines = BufReader::new(input).lines();
    let mut requests = Vec::new();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(url), None) => requests.push((UserId::from(user), url.to_string())),
            _ => bail!("Line {}: expected `<user> <url>`, got `{}`", line_no, line),
        }
    }

    Ok(requests)
}

fn report(outcomes: &[Outcome], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(outcomes)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct OutcomeRow {
                user: String,
                file: String,
                status: String,
                size: String,
                result: String,
            }

            let rows: Vec<OutcomeRow> = outcomes
                .iter()
                .map(|o| OutcomeRow {
                    user: o.user_id.clone(),
                    file: ellipsize(o.artifact_name.as_deref().unwrap_or(&o.url), 30),
                    status: o.status.to_string(),
                    size: o.bytes.map(format_bytes).unwrap_or_else(|| "-".to_string()),
                    result: o
                        .share_link
                        .clone()
                        .or_else(|| o.error.clone())
                        .unwrap_or_default(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for outcome in outcomes.iter().filter(|o| o.task_id.is_some()) {
                let name = outcome.artifact_name.as_deref().unwrap_or(&outcome.url);
                match (&outcome.share_link, &outcome.error) {
                    (Some(link), _) => println!(
                        "{} {} ({})\n  {}",
                        style("✓").green().bold(),
                        style(name).cyan(),
                        format_bytes(outcome.bytes.unwrap_or(0)),
                        link
                    ),
                    (None, error) => println!(
                        "{} {}\n  {}",
                        style("✗").red().bold(),
                        style(name).bold(),
                        style(error.as_deref().unwrap_or("Unknown error")).red()
                    ),
                }
            }
        }
    }

    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    if matches!(format, OutputFormat::Human) {
        println!();
        println!(
            "{} relayed, {} failed or rejected",
            style(outcomes.len() - failed).bold(),
            style(failed).bold()
        );
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} transfers did not complete", failed, outcomes.len()));
    }
    Ok(())
}

// ============================================================================
// History Commands
// ============================================================================

pub async fn show_history(
    storage: &Storage,
    user: Option<String>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let db = HistoryDatabase::new(storage.history_path()).await?;
    let user = user.map(UserId::from);
    let records = db.load_records(user.as_ref(), limit).await?;
    db.close().await;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct RecordRow {
                finished: String,
                user: String,
                file: String,
                size: String,
                status: String,
                link: String,
            }

            let rows: Vec<RecordRow> = records
                .iter()
                .map(|r| RecordRow {
                    finished: r.finished_at.format("%Y-%m-%d %H:%M").to_string(),
                    user: r.user_id.to_string(),
                    file: ellipsize(&r.artifact_name, 30),
                    size: format_bytes(r.bytes),
                    status: r.status.to_string(),
                    link: r.share_link.clone().unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{}", style("No transfers recorded").dim());
                return Ok(());
            }

            for record in &records {
                let icon = match record.status {
                    TaskStatus::Completed => style("✓").green(),
                    _ => style("✗").red(),
                };
                println!(
                    "{} {} {} {}",
                    icon,
                    style(&record.artifact_name).bold(),
                    style(format_bytes(record.bytes)).dim(),
                    style(record.finished_at.format("%Y-%m-%d %H:%M")).dim()
                );
                if let Some(link) = &record.share_link {
                    println!("    {}", link);
                }
                if let Some(error) = &record.error {
                    println!("    Error: {}", style(error).red());
                }
            }
            println!();
            println!("{} transfer(s) shown", style(records.len()).bold());
        }
    }

    Ok(())
}

// ============================================================================
// Stats Commands
// ============================================================================

#[derive(Debug, Serialize)]
struct StatsReport {
    user_id: String,
    /// Tasks holding one of the user's slots
    active: usize,
    limit: usize,
    rate_limit: u64,
    running: Vec<TaskSnapshot>,
    history: UserStats,
}

impl StatsReport {
    fn new(user: &UserId, running: Vec<TaskSnapshot>, settings: &Settings, history: UserStats) -> Self {
        Self {
            user_id: user.to_string(),
            active: running.iter().filter(|t| t.status.is_active()).count(),
            limit: settings.max_concurrent_per_user,
            rate_limit: settings.user_rate_limit,
            running,
            history,
        }
    }
}

pub async fn show_stats(
    core: &RelayCore,
    storage: &Storage,
    user: String,
    format: OutputFormat,
) -> Result<()> {
    let user = UserId::from(user);
    let db = HistoryDatabase::new(storage.history_path()).await?;
    let history = db.user_stats(&user).await?;
    db.close().await;

    let report = StatsReport::new(&user, core.query_active(&user), core.settings(), history);

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct StatRow {
                stat: &'static str,
                value: String,
            }

            let rows = vec![
                StatRow {
                    stat: "Active",
                    value: format!("{}/{}", report.active, report.limit),
                },
                StatRow {
                    stat: "Speed limit",
                    value: format_speed(report.rate_limit),
                },
                StatRow {
                    stat: "Transfers",
                    value: report.history.transfers.to_string(),
                },
                StatRow {
                    stat: "Completed",
                    value: report.history.completed.to_string(),
                },
                StatRow {
                    stat: "Relayed",
                    value: format_bytes(report.history.bytes),
                },
            ];
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            println!("{} {}", style("Statistics for").bold(), style(&report.user_id).cyan());
            println!();
            println!("  Active:      {}/{}", report.active, report.limit);
            println!("  Speed limit: {} per user", format_speed(report.rate_limit));
            for task in &report.running {
                println!(
                    "    {} ({})",
                    ellipsize(&task.artifact_name, 30),
                    style(task.status).dim()
                );
            }
            println!();
            println!(
                "  Transfers:   {} ({} completed)",
                report.history.transfers, report.history.completed
            );
            println!("  Relayed:     {}", format_bytes(report.history.bytes));
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: &[&str] = &[
    "max_concurrent_per_user",
    "user_rate_limit",
    "worker_pool_size",
    "chunk_size",
    "progress_step_percent",
    "fetch_timeout_secs",
    "connect_timeout_secs",
    "work_dir",
    "upload_chunk_size",
    "upload_max_retries",
    "notify_timeout_ms",
    "error_text_limit",
    "drive.upload_base",
    "drive.api_base",
    "drive.share_link_base",
    "drive.token_file",
];

fn get_key(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "max_concurrent_per_user" => settings.max_concurrent_per_user.to_string(),
        "user_rate_limit" => settings.user_rate_limit.to_string(),
        "worker_pool_size" => settings.worker_pool_size.to_string(),
        "chunk_size" => settings.chunk_size.to_string(),
        "progress_step_percent" => settings.progress_step_percent.to_string(),
        "fetch_timeout_secs" => settings.fetch_timeout_secs.to_string(),
        "connect_timeout_secs" => settings.connect_timeout_secs.to_string(),
        "work_dir" => settings.work_dir.display().to_string(),
        "upload_chunk_size" => settings.upload_chunk_size.to_string(),
        "upload_max_retries" => settings.upload_max_retries.to_string(),
        "notify_timeout_ms" => settings.notify_timeout_ms.to_string(),
        "error_text_limit" => settings.error_text_limit.to_string(),
        "drive.upload_base" => settings.drive.upload_base.clone(),
        "drive.api_base" => settings.drive.api_base.clone(),
        "drive.share_link_base" => settings.drive.share_link_base.clone(),
        "drive.token_file" => settings
            .drive
            .token_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_key(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "max_concurrent_per_user" => settings.max_concurrent_per_user = value.parse()?,
        "user_rate_limit" => settings.user_rate_limit = ceiling_from_signed(value.parse()?),
        "worker_pool_size" => settings.worker_pool_size = value.parse()?,
        "chunk_size" => settings.chunk_size = value.parse()?,
        "progress_step_percent" => {
            let step: u8 = value.parse()?;
            if !(1..=100).contains(&step) {
                bail!("progress_step_percent must be between 1 and 100");
            }
            settings.progress_step_percent = step;
        }
        "fetch_timeout_secs" => settings.fetch_timeout_secs = value.parse()?,
        "connect_timeout_secs" => settings.connect_timeout_secs = value.parse()?,
        "work_dir" => settings.work_dir = PathBuf::from(value),
        "upload_chunk_size" => settings.upload_chunk_size = value.parse()?,
        "upload_max_retries" => settings.upload_max_retries = value.parse()?,
        "notify_timeout_ms" => settings.notify_timeout_ms = value.parse()?,
        "error_text_limit" => settings.error_text_limit = value.parse()?,
        "drive.upload_base" => settings.drive.upload_base = value.to_string(),
        "drive.api_base" => settings.drive.api_base = value.to_string(),
        "drive.share_link_base" => settings.drive.share_link_base = value.to_string(),
        "drive.token_file" => {
            settings.drive.token_file = (!value.is_empty()).then(|| PathBuf::from(value))
        }
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    storage: &Storage,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await?;

            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => {
                    println!("linkrelay Configuration ({}):", storage.settings_path().display());
                    println!();
                    println!(
                        "  Max concurrent per user: {}",
                        settings.max_concurrent_per_user
                    );
                    println!(
                        "  Per-user rate limit: {}",
                        format_speed(settings.user_rate_limit)
                    );
                    println!("  Worker pool size: {}", settings.worker_pool_size);
                    println!("  Fetch timeout: {}s", settings.fetch_timeout_secs);
                    println!("  Work directory: {}", settings.work_dir.display());
                    println!(
                        "  Upload chunk size: {}",
                        format_bytes(settings.upload_chunk_size as u64)
                    );
                    println!(
                        "  Token file: {}",
                        settings
                            .drive
                            .token_file
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "(data directory)".to_string())
                    );
                    println!();
                    println!(
                        "{}",
                        style(format!("Keys: {}", CONFIG_KEYS.join(", "))).dim()
                    );
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = storage.load_settings().await?;
            println!("{}", get_key(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = storage.load_settings().await?;
            set_key(&mut settings, &key, &value)
                .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            storage.save_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                storage.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
