use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferro_core::{BenchConfig, Metadata, SetupError, SETUP_FAILURE_EXIT};
use ferro_mine::{process_bench, regex_parser, MineOptions};
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ferrobench",
    version,
    about = "Benchmark matrix generation and log mining for SLURM clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a benchmark definition into job directories, per-job scripts
    /// and scheduler artifacts below the current directory.
    Generate {
        bench_config: PathBuf,
        /// Regenerate into existing directories instead of aborting.
        #[arg(long)]
        overwrite: bool,
    },
    /// Show what a definition would generate, without writing anything.
    Describe {
        bench_config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Mine a finished benchmark tree into flat JSON records.
    Mine {
        bench_dir: PathBuf,
        /// Pattern with named capture groups, applied to each stdout.log.
        #[arg(long)]
        pattern: String,
        /// metadata.json written at generation time; without it records
        /// carry the raw directory IDs.
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Secondary pattern applied to stderr.log; primary fields win on
        /// collisions.
        #[arg(long)]
        error_pattern: Option<String>,
        /// Extract hostname/date/affinity from node_info.log.
        #[arg(long)]
        node_info: bool,
        /// Extract peak memory and cpu times from runsolver.log.
        #[arg(long)]
        runsolver_stats: bool,
        /// Extract hardware counters from perf.log.
        #[arg(long)]
        perf: bool,
        /// Write the records to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run_command(cli.command) {
        eprintln!("error: {:#}", err);
        let code = if err.downcast_ref::<SetupError>().is_some() {
            SETUP_FAILURE_EXIT
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Generate {
            bench_config,
            overwrite,
        } => {
            let mut config = BenchConfig::load(&bench_config)?;
            config.overwrite |= overwrite;
            let definition_dir = definition_dir(&bench_config)?;
            let out_dir = std::env::current_dir()?;
            let report = ferro_matrix::generate(&config, &definition_dir, &out_dir)?;
            for bench in &report.benchmarks {
                println!("benchmark: {}", bench.label);
                println!("  root: {}", bench.root.display());
                println!("  jobs: {}", bench.jobs);
                println!("  submit: {}/submit_all.sh", bench.root.display());
            }
            println!("total jobs: {}", report.total_jobs());
        }
        Commands::Describe { bench_config, json } => {
            let config = BenchConfig::load(&bench_config)?;
            let definition_dir = definition_dir(&bench_config)?;
            let (summaries, config_count) = ferro_matrix::summarize(&config, &definition_dir)?;
            let allocation = ferro_matrix::compute_allocation(&config);
            let total_jobs: usize = summaries.iter().map(|s| s.jobs).sum();
            if json {
                let payload = json!({
                    "name": config.name,
                    "configs": config_count,
                    "runs": config.runs,
                    "benchmarks": summaries.iter().map(|s| json!({
                        "label": s.label,
                        "instances": s.instances,
                        "jobs": s.jobs,
                    })).collect::<Vec<_>>(),
                    "total_jobs": total_jobs,
                    "allocation": {
                        "cpus": allocation.cpus,
                        "cache_lines": allocation.cache_lines,
                        "mem_per_cpu": allocation.mem_per_cpu,
                        "wall_seconds": allocation.wall_seconds,
                    }
                });
                println!("{}", serde_json::to_string(&payload)?);
                return Ok(());
            }
            println!("name: {}", config.name);
            println!("configs: {}", config_count);
            println!("runs per pair: {}", config.runs);
            for summary in &summaries {
                println!(
                    "benchmark {}: {} instances, {} jobs",
                    summary.label, summary.instances, summary.jobs
                );
            }
            println!("total jobs: {}", total_jobs);
            println!(
                "allocation: {} cpus, {} cache lines, {} MB per cpu, {}s wall clock",
                allocation.cpus, allocation.cache_lines, allocation.mem_per_cpu,
                allocation.wall_seconds
            );
        }
        Commands::Mine {
            bench_dir,
            pattern,
            metadata,
            error_pattern,
            node_info,
            runsolver_stats,
            perf,
            out,
        } => {
            let pattern = Regex::new(&pattern).context("invalid --pattern")?;
            let mut options = MineOptions {
                metadata: match metadata {
                    Some(path) => Some(Metadata::load(&path)?),
                    None => None,
                },
                node_info,
                runsolver_stats,
                perf_stats: perf,
                ..MineOptions::default()
            };
            if let Some(raw) = error_pattern {
                let compiled = Regex::new(&raw).context("invalid --error-pattern")?;
                options.error_parser = Some(Box::new(regex_parser(compiled)));
            }
            let records = process_bench(&bench_dir, regex_parser(pattern), &options)?;
            let rendered = serde_json::to_string_pretty(&records)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {} records to {}", records.len(), path.display());
                }
                None => println!("{}", rendered),
            }
        }
    }
    Ok(())
}

fn definition_dir(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(canonical
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf())
}
