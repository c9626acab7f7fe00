//! grade - boot a kernel image under QEMU and score its console output.
//!
//! Reads a TOML suite (see `demos/lab1-extra.toml`), runs every test in
//! order and prints a per-test breakdown followed by the score.
//!
//! Exit status: 0 when every test passed, 1 when any failed or errored,
//! 2 when the session could not run at all (bad artifact, missing emulator).

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kernel_grader::{Outcome, QemuEmulator, Report, Runner, SuiteConfig, TestResult};

#[derive(Parser)]
#[command(name = "grade")]
#[command(about = "Grade a kernel image by matching its QEMU console output")]
struct Cli {
    /// Suite file describing the image, emulator and expectations
    #[arg(long, short)]
    suite: PathBuf,

    /// Override the artifact path from the suite
    #[arg(long)]
    artifact: Option<PathBuf>,

    /// Override the default run timeout (seconds)
    #[arg(long)]
    timeout: Option<u64>,

    /// Also write the report as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(2);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let mut suite = SuiteConfig::load(&cli.suite)?;
    if let Some(artifact) = &cli.artifact {
        suite.artifact = artifact.clone();
    }
    if let Some(timeout) = cli.timeout {
        suite.timeout = timeout;
    }

    println!("{}", "Kernel grading".bold());
    println!("  Artifact:  {}", suite.artifact.display());
    println!("  Emulator:  {}", suite.emulator.binary);
    if let Some(bp) = &suite.breakpoint {
        println!("  Stop at:   {}", bp);
    }
    println!();

    let emulator = QemuEmulator::new(suite.emulator.clone());
    let mut runner = Runner::new(&suite.artifact, Box::new(emulator))?;
    if let Some(bp) = &suite.breakpoint {
        runner = runner.with_breakpoint(bp)?;
    }
    if let Some(save) = &suite.save {
        runner = runner.save_to(save);
    }

    let registry = suite.registry();
    let report = registry.run_all_with(&mut runner, print_result);
    print_summary(&report);

    if let Some(path) = &cli.json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Writing {}", path.display()))?;
    }

    Ok(report.exit_code())
}

fn print_result(result: &TestResult) {
    let label = match result.outcome {
        Outcome::Passed => result.outcome.label().green().bold(),
        Outcome::Failed => result.outcome.label().red().bold(),
        Outcome::Errored => result.outcome.label().yellow().bold(),
    };
    println!(
        "{}: {} ({:.1}s)",
        result.description,
        label,
        result.duration.as_secs_f64()
    );
    if let Some(detail) = &result.detail {
        println!("    {}", detail);
    }
}

fn print_summary(report: &Report) {
    println!();

    if let Some(reason) = &report.aborted {
        println!("{} {}", "Session aborted:".red().bold(), reason);
    }
    if let Some(stop) = &report.emulator_stop {
        println!("  Emulator stop: {}", stop);
    }

    if !report.log_tail.is_empty() {
        println!("{}", "Last output:".yellow());
        for line in &report.log_tail {
            println!("    {}", line);
        }
    }
    if let Some(saved) = &report.saved_log {
        println!("  Emulator output saved to {}", saved.display());
    }

    println!("{}", "━".repeat(60));
    let score = format!("Score: {}/{}", report.score(), report.max_score());
    if report.all_passed() {
        println!("{} {}", "✓".green().bold(), score.bold());
    } else {
        println!(
            "{} {} ({} failed, {} errored)",
            "✗".red().bold(),
            score.bold(),
            report.count(Outcome::Failed),
            report.count(Outcome::Errored)
        );
    }
}
