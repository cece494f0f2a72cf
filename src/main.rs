use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

use gitlab_notion_sync::config::Config;
use gitlab_notion_sync::gitlab::GitlabClient;
use gitlab_notion_sync::notion::NotionClient;
use gitlab_notion_sync::sync::{SyncEngine, SyncOptions};

/// Registered jobs. Dispatch is a closed enum so an unknown name fails at
/// the edge instead of deep inside a string registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    SyncMergeRequests,
}

impl Job {
    const NAMES: &'static [&'static str] = &["sync-merge-requests"];

    fn name(self) -> &'static str {
        match self {
            Job::SyncMergeRequests => "sync-merge-requests",
        }
    }
}

impl FromStr for Job {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync-merge-requests" => Ok(Job::SyncMergeRequests),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync merged GitLab merge requests into a Notion database"
)]
struct Args {
    /// Job to run; falls back to the JOB_NAME environment variable
    #[arg(long)]
    job: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let Some(job_name) = args.job.or_else(|| std::env::var("JOB_NAME").ok()) else {
        eprintln!("no job selected; set JOB_NAME or pass --job <name>");
        eprintln!("available jobs: {}", Job::NAMES.join(", "));
        return ExitCode::from(2);
    };

    let Ok(job) = job_name.parse::<Job>() else {
        eprintln!("unknown job {:?}", job_name);
        eprintln!("available jobs: {}", Job::NAMES.join(", "));
        return ExitCode::from(2);
    };

    info!(job = job.name(), "starting job");
    match run_job(job).await {
        Ok(false) => ExitCode::SUCCESS,
        // Partial failure: the run completed but some records did not land.
        Ok(true) => ExitCode::from(1),
        Err(err) => {
            error!(?err, job = job.name(), "job failed");
            ExitCode::from(1)
        }
    }
}

async fn run_job(job: Job) -> Result<bool> {
    match job {
        Job::SyncMergeRequests => sync_merge_requests().await,
    }
}

async fn sync_merge_requests() -> Result<bool> {
    let cfg = Config::from_env()?;
    let gitlab = GitlabClient::new(&cfg.gitlab.base_url, cfg.gitlab.token.clone())?;
    let notion = NotionClient::new(cfg.notion.token.clone(), cfg.notion.version.clone());

    let engine = SyncEngine::new(Arc::new(gitlab), Arc::new(notion));
    let options = SyncOptions::from_config(&cfg);
    let report = engine.run(&options).await?;

    println!("{}", report.summary());
    for failure in &report.failures {
        println!("  MR-{}: {}", failure.iid, failure.message);
    }
    Ok(report.has_failures())
}
