//! # Minis Validation CLI
//!
//! Command-line interface for the minis frequency calibration pipeline.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use minis_sim::{LocalExecutor, RunOptions, SyntheticSimulator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "minis")]
#[command(version = "0.1.0")]
#[command(about = "Minis frequency calibration pipeline", long_about = None)]
struct Cli {
    /// -v for WARNING, -vv for INFO, -vvv for DEBUG
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate every condition at every candidate frequency and
    /// consolidate the traces
    Simulate {
        /// Cell population file (JSON)
        population: PathBuf,
        /// Candidate frequency table with a MINIS_FREQ column (TSV)
        frequencies: PathBuf,
        /// Folder of config_<CELL_TYPE>_<Exc|Inh>.yaml condition files
        jobs_configs_dir: PathBuf,
        /// Folder where to store simulation results (must not exist)
        output: PathBuf,

        /// Number of cells to simulate per condition
        #[arg(short = 'n', long, default_value_t = 1000)]
        num_cells: usize,
        /// Override "$target" of the conditions' cell queries
        #[arg(short, long)]
        target: Option<String>,
        /// Pseudo-random generator seed
        #[arg(short, long, default_value_t = 0)]
        seed: u64,
        /// Override duration of simulations (ms)
        #[arg(short, long)]
        duration: Option<f64>,
        /// Override forward-skip value of simulations (ms)
        #[arg(long)]
        forward_skip: Option<f64>,
        /// Batch size to be processed in each job
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Time to live for simulation workers in seconds
        #[arg(long, default_value_t = 3600)]
        timeout_s: u64,
    },

    /// Analyze results of a single condition
    AnalyzeJob {
        /// Condition config file
        job_config_file: PathBuf,
        /// Folder with the condition's consolidated trace archives
        job_traces_dir: PathBuf,
    },

    /// Analyze results of all conditions and write the final report
    AnalyzeJobs {
        /// Folder of condition config files
        jobs_configs_dir: PathBuf,
        /// Folder with per-condition trace archives
        jobs_traces_dir: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate {
            population,
            frequencies,
            jobs_configs_dir,
            output,
            num_cells,
            target,
            seed,
            duration,
            forward_skip,
            batch_size,
            timeout_s,
        } => {
            if output.exists() {
                bail!("can't output to existing folder: {}", output.display());
            }
            let executor = LocalExecutor::with_timeout(Duration::from_secs(timeout_s));
            let options = RunOptions {
                num_cells,
                target,
                seed,
                duration,
                forward_skip,
                batch_size,
            };
            println!(
                "{} {}",
                "Simulating conditions from".green().bold(),
                jobs_configs_dir.display()
            );
            minis_sim::run(
                &population,
                &frequencies,
                &jobs_configs_dir,
                &output,
                Arc::new(SyntheticSimulator::default()),
                &executor,
                &options,
            )?;
            println!(
                "{} {}",
                "Trace archives saved to".green().bold(),
                output.display()
            );
        }

        Commands::AnalyzeJob {
            job_config_file,
            job_traces_dir,
        } => match minis_analysis::analyze_job(&job_config_file, &job_traces_dir)? {
            Some(row) => {
                println!(
                    "{} {}: minis frequency {}",
                    "Calibrated".green().bold(),
                    row.pathway.cyan(),
                    format!("{:.3} Hz", row.minis_freq).bold()
                );
            }
            None => {
                println!(
                    "{} {}",
                    "No trace archives found in".yellow(),
                    job_traces_dir.display()
                );
            }
        },

        Commands::AnalyzeJobs {
            jobs_configs_dir,
            jobs_traces_dir,
        } => {
            let rows = minis_analysis::analyze_jobs(&jobs_configs_dir, &jobs_traces_dir)?;
            println!("{}", "pathway  ref_freq  ref_std  Ca  minis_freq".bold());
            for row in &rows {
                println!(
                    "{}  {:.3}  {:.3}  {:.2}  {:.3}",
                    row.pathway.cyan(),
                    row.ref_freq,
                    row.ref_std,
                    row.calcium,
                    row.minis_freq
                );
            }
            println!(
                "{} {}",
                "Report written to".green().bold(),
                jobs_traces_dir.join("job_results.csv").display()
            );
        }
    }

    Ok(())
}
