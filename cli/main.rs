#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use riskgap::config::AnalysisConfig;
use riskgap::pipeline::{SUMMARY_FILE, run_analysis};

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Path to the delimited patient file (header row required)
    #[arg(value_name = "DATA")]
    pub data: PathBuf,

    /// TOML configuration file; defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory receiving figures, tables and the run summary
    #[arg(long, value_name = "DIR", default_value = "riskgap_out")]
    pub out_dir: PathBuf,

    /// Field delimiter of the input file, overriding the configuration
    #[arg(long, value_name = "C")]
    pub delimiter: Option<char>,
}

#[derive(Parser)]
#[command(
    name = "riskgap",
    about = "Audit a health risk score for disparities across patient groups",
    long_about = "Converts a risk score into percentiles, averages health outcomes by \
                 percentile and patient group, fits LOWESS and GLM curves per group, \
                 and renders comparative figures."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis over a patient file
    #[command(about = "Run the analysis (outputs: *.svg, *.tsv, summary.toml)")]
    Analyze(AnalyzeArgs),

    /// Write the default configuration
    #[command(about = "Print or save the default configuration as TOML")]
    Config {
        /// Write to this file instead of standard output
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Analyze(args)) => analyze(args),
        Some(Commands::Config { output }) => write_default_config(output),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn analyze(args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            AnalysisConfig::load(path)?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(delimiter) = args.delimiter {
        config.delimiter = delimiter;
    }

    println!("Analyzing: {}", args.data.display());
    let report = run_analysis(&args.data, &config, &args.out_dir)?;

    println!("Loaded {} records", report.n_rows);
    for figure in &report.figures {
        println!(
            "Figure '{}': {} groups across {} categories -> {}",
            figure.name,
            figure.groups,
            figure.categories.len(),
            args.out_dir.join(&figure.svg_file).display()
        );
        for glm in &figure.glm {
            println!(
                "  GLM {}: intercept {:.4}, slope {:.4} ({:?} after {} iterations)",
                glm.category, glm.intercept, glm.slope, glm.status, glm.iterations
            );
        }
    }
    for threshold in &report.thresholds {
        let shares = threshold
            .shares
            .iter()
            .map(|s| format!("{} {:.1}%", s.category, s.fraction * 100.0))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "At or above percentile {}: {} records ({})",
            threshold.cutoff, threshold.flagged, shares
        );
    }
    println!(
        "Summary written to {}",
        args.out_dir.join(SUMMARY_FILE).display()
    );
    Ok(())
}

fn write_default_config(output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AnalysisConfig::default();
    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}
