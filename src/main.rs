use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use etl_engine::config::EtlConfig;
use etl_engine::logging;
use etl_engine::orchestrator::{JobResult, JobStatus, Orchestrator};
use etl_engine::registry::PipelineRegistry;

#[derive(Parser)]
#[command(name = "etl_engine")]
#[command(about = "Pluggable ETL pipelines producing star-schema tables")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (defaults to ./etl.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered pipelines and their status
    List,
    /// Show one pipeline in detail
    Status { name: String },
    /// Run a single pipeline
    Run {
        name: String,
        /// Parameter override as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Run every available pipeline
    RunAll {
        /// Also attempt pipelines whose credential is missing
        #[arg(long)]
        include_credentialed: bool,
        /// Run up to N pipelines at once
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Show recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Aggregate pipeline and job counts
    Summary,
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_params(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --param '{}', expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn print_job(job: &JobResult) {
    println!("\n📊 Job {} ({})", job.job_id, job.pipeline);
    println!("   Status: {}", job.status);
    println!("   Records extracted: {}", job.records_extracted);
    println!("   Rows written: {}", job.total_rows);
    if let Some(score) = job.quality_score {
        println!("   Quality score: {:.3}", score);
    }
    for (table, rows) in &job.row_counts {
        println!("   - {}: {} rows", table, rows);
    }
    if let Some(error) = &job.error {
        println!("   ⚠️  Error: {}", error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EtlConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let _guard = logging::init_logging(&config.log_dir);
    let config = Arc::new(config);

    let registry = Arc::new(PipelineRegistry::new(Arc::clone(&config)));
    let orchestrator = Orchestrator::new(Arc::clone(&registry)).context("opening job history")?;

    match cli.command {
        Commands::List => {
            for info in registry.list_pipelines() {
                println!(
                    "{:<10} {:<20} {:<12} {}",
                    info.name,
                    info.status.to_string(),
                    info.extractor,
                    info.description
                );
            }
        }
        Commands::Status { name } => {
            let info = registry.get_pipeline_info(&name)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Run { name, params } => {
            let params = parse_params(&params)?;
            info!("Running pipeline {}", name);
            let job = orchestrator.run_pipeline(&name, Some(params)).await;
            print_job(&job);
            if job.status != JobStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::RunAll {
            include_credentialed,
            parallel,
        } => {
            let jobs = match parallel {
                Some(n) if n > 1 => {
                    orchestrator
                        .run_all_pipelines_concurrently(None, !include_credentialed, n)
                        .await
                }
                _ => orchestrator.run_all_pipelines(None, !include_credentialed).await,
            };
            for job in &jobs {
                print_job(job);
            }
            let failed = jobs.iter().filter(|j| j.status != JobStatus::Completed).count();
            println!("\n✅ {} of {} pipelines succeeded", jobs.len() - failed, jobs.len());
        }
        Commands::Jobs { limit } => {
            for job in orchestrator.list_jobs(Some(limit)) {
                println!(
                    "{}  {:<10} {:<10} {:>8} rows  {}",
                    job.job_id,
                    job.pipeline,
                    job.status.to_string(),
                    job.total_rows,
                    job.error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Summary => {
            let summary = orchestrator.get_summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
