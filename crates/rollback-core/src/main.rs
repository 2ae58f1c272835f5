use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollback_core::sim::{run_scenario, run_simulation, Scenario, SimulationConfig};
use rollback_core::RollbackConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn cli() -> Command {
    Command::new("rollback")
        .version(rollback_core::VERSION)
        .about("Rollback orchestration engine driven by simulated backends")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Increase log verbosity (-v info, -vv debug, -vvv trace)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print reports as JSON"),
        )
        .subcommand(
            Command::new("scenario")
                .about("Run a reference scenario (a, b, c or all)")
                .arg(
                    Arg::new("name")
                        .default_value("all")
                        .help("Scenario to run"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run randomised executions and check engine invariants")
                .arg(
                    Arg::new("runs")
                        .long("runs")
                        .default_value("100")
                        .value_parser(value_parser!(u64))
                        .help("Number of executions to attempt"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Probability that a step attempt fails"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

fn init_tracing(matches: &ArgMatches) {
    let filter = match matches.get_count("verbose") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if matches.get_flag("json-logs") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<RollbackConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => RollbackConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(RollbackConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(&matches);
    let config = load_config(&matches)?;
    let json = matches.get_flag("json");

    match matches.subcommand() {
        Some(("scenario", args)) => {
            let name = args
                .get_one::<String>("name")
                .map_or("all", String::as_str);
            let scenarios = if name.eq_ignore_ascii_case("all") {
                Scenario::ALL.to_vec()
            } else {
                vec![name.parse::<Scenario>()?]
            };

            for scenario in scenarios {
                let report = run_scenario(scenario, config.clone())
                    .await
                    .with_context(|| format!("scenario {scenario:?}"))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("{}", report.generate_text());
                }
            }
        }
        Some(("simulate", args)) => {
            let defaults = SimulationConfig::default();
            let sim = SimulationConfig {
                runs: args.get_one::<u64>("runs").copied().unwrap_or(defaults.runs),
                seed: args.get_one::<u64>("seed").copied().unwrap_or(defaults.seed),
                failure_rate: args
                    .get_one::<f64>("failure-rate")
                    .copied()
                    .unwrap_or(defaults.failure_rate),
                ..defaults
            };
            anyhow::ensure!(
                (0.0..=1.0).contains(&sim.failure_rate),
                "failure rate must be within 0.0..=1.0"
            );

            let report = run_simulation(sim, config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }

            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("config", _)) => {
            print!("{}", config.to_toml_string()?);
        }
        _ => {
            println!("rollback v{}", rollback_core::VERSION);
            println!();
            println!("Use 'rollback --help' for usage information.");
            println!("  rollback scenario all     Run the reference scenarios");
            println!("  rollback simulate         Run randomised executions");
            println!("  rollback config           Print the effective configuration");
        }
    }

    Ok(())
}
