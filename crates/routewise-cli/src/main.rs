//! Routewise CLI - inspect configs and drive routing domains with synthetic traffic

use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use routewise_core::experiment::{ExperimentReport, VariantReport};
use routewise_core::policy::PolicyDiagnostics;
use routewise_core::prelude::*;
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "routewise")]
#[command(author, version, about = "Adaptive bandit routing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an engine config and list its domains and experiments
    Check {
        /// Path to the TOML engine config
        config: PathBuf,
    },

    /// Drive one domain with synthetic Bernoulli arms
    Simulate {
        /// Path to the TOML engine config
        config: PathBuf,
        /// Domain to drive
        #[arg(short, long)]
        domain: String,
        #[command(flatten)]
        traffic: TrafficArgs,
    },

    /// Drive an experiment's baseline domain and report on its variants
    Experiment {
        /// Path to the TOML engine config
        config: PathBuf,
        /// Experiment id
        #[arg(long)]
        id: String,
        #[command(flatten)]
        traffic: TrafficArgs,
    },
}

#[derive(clap::Args)]
struct TrafficArgs {
    /// Number of requests to simulate
    #[arg(short, long, default_value_t = 1000)]
    rounds: u64,

    /// Seed for contexts and rewards
    #[arg(short, long)]
    seed: Option<u64>,

    /// Synthetic arm as name=success_probability (repeatable)
    #[arg(long = "arm", value_parser = parse_arm, required = true)]
    arms: Vec<SyntheticArm>,
}

/// Arm paying 1.0 with a fixed probability, 0.0 otherwise
#[derive(Debug, Clone, PartialEq)]
struct SyntheticArm {
    name: String,
    success_rate: f64,
}

fn parse_arm(raw: &str) -> std::result::Result<SyntheticArm, String> {
    let (name, rate) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=probability, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("arm name missing in '{}'", raw));
    }
    let success_rate: f64 = rate
        .trim()
        .parse()
        .map_err(|_| format!("invalid probability '{}'", rate))?;
    if !(0.0..=1.0).contains(&success_rate) {
        return Err(format!("probability must be in [0, 1], got {}", success_rate));
    }
    Ok(SyntheticArm {
        name: name.to_string(),
        success_rate,
    })
}

/// Synthetic traffic source: uniform contexts, Bernoulli rewards
struct Traffic {
    rng: StdRng,
    arms: Vec<SyntheticArm>,
    dim: usize,
}

impl Traffic {
    fn new(args: &TrafficArgs, dim: usize) -> Self {
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            arms: args.arms.clone(),
            dim,
        }
    }

    fn candidates(&self) -> Vec<&str> {
        self.arms.iter().map(|a| a.name.as_str()).collect()
    }

    fn context(&mut self) -> Context {
        (0..self.dim)
            .map(|i| (format!("x{}", i), self.rng.gen_range(0.0..1.0)))
            .collect()
    }

    fn reward(&mut self, arm: &str) -> anyhow::Result<f64> {
        let rate = self
            .arms
            .iter()
            .find(|a| a.name == arm)
            .map(|a| a.success_rate)
            .ok_or_else(|| anyhow!("engine returned unknown arm '{}'", arm))?;
        Ok(if self.rng.gen_bool(rate) { 1.0 } else { 0.0 })
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routewise=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => cmd_check(&config, cli.format, cli.quiet),
        Commands::Simulate {
            config,
            domain,
            traffic,
        } => cmd_simulate(&config, &domain, &traffic, cli.format, cli.quiet),
        Commands::Experiment {
            config,
            id,
            traffic,
        } => cmd_experiment(&config, &id, &traffic, cli.format, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn load_manager(path: &Path) -> anyhow::Result<(EngineConfig, ExperimentManager)> {
    let config = EngineConfig::load(path)?;
    let manager = ExperimentManager::from_config(&config)
        .with_context(|| format!("Failed to build engine from {}", path.display()))?;
    Ok((config, manager))
}

fn cmd_check(path: &Path, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let (config, manager) = load_manager(path)?;

    if format == OutputFormat::Json {
        let domains: Vec<_> = config
            .domains
            .iter()
            .map(|d| {
                json!({
                    "name": d.name,
                    "policy_type": d.policy.policy_type(),
                    "dim": d.policy.dim(),
                    "seed": d.seed,
                })
            })
            .collect();
        let output = json!({
            "valid": true,
            "domains": domains,
            "experiments": manager.list_experiments(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if quiet {
        return Ok(());
    }

    println!("Config OK: {}", path.display());
    println!("Domains ({}):", config.domains.len());
    for domain in &config.domains {
        let seed = domain
            .seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<18} dim={:<3} seed={}",
            domain.name,
            domain.policy.policy_type(),
            domain.policy.dim(),
            seed
        );
    }
    println!("Experiments ({}):", config.experiments.len());
    for experiment in &config.experiments {
        let variants: Vec<String> = experiment
            .variants
            .iter()
            .map(|v| format!("{}({:.2})", v.name, v.traffic_fraction))
            .collect();
        println!(
            "  {:<20} domain={} shadow_samples={} variants={}",
            experiment.id,
            experiment.domain,
            experiment.shadow_samples,
            variants.join(",")
        );
    }
    Ok(())
}

fn cmd_simulate(
    path: &Path,
    domain: &str,
    args: &TrafficArgs,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let (_, manager) = load_manager(path)?;
    let engine = manager.engine();
    let dim = engine.domain_config(domain)?.dim();
    let mut traffic = Traffic::new(args, dim);
    let candidates: Vec<String> = traffic.candidates().into_iter().map(String::from).collect();

    let mut total_reward = 0.0;
    for _ in 0..args.rounds {
        let context = traffic.context();
        let arm = engine.recommend(domain, &context, &candidates)?;
        let reward = traffic.reward(&arm)?;
        engine.record(domain, &context, &arm, reward)?;
        total_reward += reward;
    }
    info!(domain, rounds = args.rounds, total_reward, "Simulation finished");

    let stats = engine.get_stats(domain)?;
    match format {
        OutputFormat::Json => {
            let output = json!({
                "rounds": args.rounds,
                "total_reward": total_reward,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text if !quiet => {
            let mean = if args.rounds > 0 {
                total_reward / args.rounds as f64
            } else {
                0.0
            };
            println!(
                "Domain: {} ({}, dim {})",
                stats.domain, stats.policy_type, stats.dim
            );
            println!("Rounds: {}", args.rounds);
            println!("Total reward: {:.1} (mean {:.3})", total_reward, mean);
            println!("Arms:");
            let expected = engine.expected_values(domain)?;
            for arm in &stats.arms {
                println!(
                    "  {:<16} pulls={:<6} mean={:.3} expected={:.3}",
                    arm.arm,
                    arm.pulls,
                    arm.mean_reward,
                    expected.get(&arm.arm).copied().unwrap_or(0.0)
                );
            }
            print_diagnostics(&stats.diagnostics);
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

fn cmd_experiment(
    path: &Path,
    id: &str,
    args: &TrafficArgs,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let (config, manager) = load_manager(path)?;
    let spec = config
        .experiment(id)
        .ok_or_else(|| anyhow!("Experiment '{}' is not defined in {}", id, path.display()))?;
    let dim = manager.engine().domain_config(&spec.domain)?.dim();
    let mut traffic = Traffic::new(args, dim);
    let candidates: Vec<String> = traffic.candidates().into_iter().map(String::from).collect();

    for _ in 0..args.rounds {
        let context = traffic.context();
        let served = manager.recommend(id, &context, &candidates)?;
        let reward = traffic.reward(&served)?;
        manager.record(id, &context, &candidates, &served, reward)?;
    }

    let report = manager.report(id)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text if !quiet => print_report(&report),
        OutputFormat::Text => {}
    }
    Ok(())
}

fn print_report(report: &ExperimentReport) {
    println!("Experiment: {}", report.id);
    if !report.description.is_empty() {
        println!("  {}", report.description);
    }
    println!(
        "Baseline: {} ({}) pulls={} mean={:.3}",
        report.baseline.domain,
        report.baseline.policy_type,
        report.baseline.pulls,
        report.baseline.mean_reward
    );
    println!("Variants (shadow_samples={}):", report.shadow_samples);
    for variant in &report.variants {
        print_variant(variant);
    }
}

fn print_variant(variant: &VariantReport) {
    let improvement = variant
        .reward_improvement_pct
        .map(|pct| format!("{:+.1}%", pct))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "  {:<16} {:<18} status={} pulls={} mean={:.3} improvement={} skipped={} -> {}",
        variant.name,
        variant.policy_type,
        variant.status,
        variant.pulls,
        variant.mean_reward,
        improvement,
        variant.skipped_mismatch,
        variant.recommendation
    );
}

fn print_diagnostics(diagnostics: &PolicyDiagnostics) {
    match diagnostics {
        PolicyDiagnostics::ThompsonSampling { posteriors } => {
            println!("Posteriors:");
            for p in posteriors {
                println!("  {:<16} alpha={:.1} beta={:.1}", p.arm, p.alpha, p.beta);
            }
        }
        PolicyDiagnostics::DoublyRobust {
            mean_abs_residual,
            current_learning_rate,
            ..
        } => {
            println!(
                "Regression: mean_abs_residual={:.4} learning_rate={:.4}",
                mean_abs_residual, current_learning_rate
            );
        }
        PolicyDiagnostics::OffsetTree {
            depth,
            leaf_count,
            splits,
            ..
        } => {
            println!("Tree: depth={} leaves={}", depth, leaf_count);
            for split in splits {
                println!(
                    "  split node={} {} <= {:.3} gain={:.4}",
                    split.node, split.feature_name, split.threshold, split.gain
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_arm() {
        assert_eq!(
            parse_arm("fast=0.7").unwrap(),
            SyntheticArm {
                name: "fast".to_string(),
                success_rate: 0.7
            }
        );
        assert!(parse_arm("fast").is_err());
        assert!(parse_arm("=0.5").is_err());
        assert_eq!(
            parse_arm("fast=1.5").unwrap_err(),
            "probability must be in [0, 1], got 1.5"
        );
        assert!(parse_arm("fast=abc").is_err());
    }

    #[test]
    fn test_traffic_is_reproducible() {
        let args = TrafficArgs {
            rounds: 10,
            seed: Some(3),
            arms: vec![parse_arm("a=0.5").unwrap()],
        };
        let mut first = Traffic::new(&args, 2);
        let mut second = Traffic::new(&args, 2);
        for _ in 0..10 {
            assert_eq!(first.context(), second.context());
            assert_eq!(first.reward("a").unwrap(), second.reward("a").unwrap());
        }
        assert!(first.reward("missing").is_err());
    }
}
