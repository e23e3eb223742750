use std::time::Duration;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, Command};
use kvs_scheduler::logging::{self, LogFormat};
use kvs_scheduler::test_harness::dataplane::{abf_key, acl_key, interface_key, Abf, Acl, Interface};
use kvs_scheduler::test_harness::{run_simulator, Dataplane, SimulatorConfig};
use kvs_scheduler::{Registry, RetryPolicy, Scheduler, SchedulerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Command::new("kvs-scheduler")
        .version(VERSION)
        .about("KV scheduler: dependency-aware reconciliation of dataplane configuration")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run randomized transactions against a mock southbound and check invariants")
                .arg(
                    Arg::new("ops")
                        .long("ops")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
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
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability of injecting a southbound failure"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop simulation on first violation"),
                ),
        )
        .subcommand(
            Command::new("demo")
                .about("Configure ACL and ABF on a simulated dataplane and print the history")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the transaction history as JSON"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a scheduler configuration file")
                .arg(
                    Arg::new("path")
                        .long("path")
                        .required(true)
                        .help("YAML or JSON configuration file"),
                ),
        );

    let matches = cli.get_matches();
    let format = if matches.get_flag("log-json") {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    logging::init("kvs_scheduler=info", format);

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                total_operations: args.get_one::<u64>("ops").copied().unwrap_or(200),
                failure_rate: args.get_one::<f64>("failure-rate").copied().unwrap_or(0.05),
                stop_on_first_violation: args.get_flag("stop-on-violation"),
                ..SimulatorConfig::default()
            };
            println!("Running KV scheduler simulator...");
            println!("Operations: {}", config.total_operations);
            println!("Seed: {}", config.seed);
            println!();

            let report = run_simulator(config).await?;
            println!("{}", report.generate_text());
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Some(("demo", args)) => demo(args.get_flag("json")).await?,
        Some(("check-config", args)) => {
            let path = args
                .get_one::<String>("path")
                .context("missing --path")?;
            let config = SchedulerConfig::load(path).with_context(|| format!("loading {path}"))?;
            config.validate().context("validating configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => {
            println!("kvs-scheduler {VERSION}");
            println!("Run with --help for usage");
        }
    }
    Ok(())
}

async fn demo(json: bool) -> anyhow::Result<()> {
    let dataplane = Dataplane::new();
    let mut registry = Registry::new();
    dataplane.register(&mut registry)?;
    let scheduler = Scheduler::new(SchedulerConfig::default(), registry)?;

    // ABF first: it waits for its ACL and interface
    let abf = Abf::new(1, "acl1").attach("tap0", 10).forward_via("memif1", "10.0.0.1");
    let first = scheduler
        .start_txn()
        .description("ABF before its ACL")
        .put(abf_key(1), abf)
        .put(interface_key("tap0"), Interface::new("tap0"))
        .commit()
        .await?;
    println!("ABF pending: {:?}", first.state(&abf_key(1)));

    let second = scheduler
        .start_txn()
        .description("ACL and path interface")
        .put(acl_key("acl1"), Acl::permit("acl1", "10.0.0.0/24"))
        .put(interface_key("memif1"), Interface::new("memif1"))
        .retry(RetryPolicy::new(Duration::from_millis(100), 3, true))
        .deadline(Duration::from_secs(1))
        .commit()
        .await?;
    if !second.is_success() {
        bail!("demo transaction failed: {:?}", second.failed_keys());
    }
    println!("ABF after ACL: {:?}", scheduler.value_status(&abf_key(1)).state);
    println!("Attachments: {:?}", dataplane.attachments());

    let refresh = scheduler.refresh(kvs_scheduler::RefreshOptions::all()).await?;
    if let Some(report) = &refresh.refresh {
        println!("Refresh clean: {}", report.is_clean());
    }

    let history = scheduler.transaction_history();
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        for txn in &history {
            println!("{}", txn.summary());
        }
    }
    scheduler.close();
    Ok(())
}
