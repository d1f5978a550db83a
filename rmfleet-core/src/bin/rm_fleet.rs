//! Operator entry point: discovers node certificates, brings the fleet up
//! against the broker, then drops into a small interactive shell.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rmfleet_core::{
    initialize_logging, parse_broker_endpoint, CommandFrame, Fleet, FleetConfig, LogFormat,
    LogLevel, LogTarget, LoggingConfig, MqttSessionFactory, OtaStatus, PublishReport,
    SessionConfig, UserRole,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(
    name = "rm-fleet",
    about = "Fleet-scale MQTT node manager: connect every provisioned node and drive it from one shell"
)]
struct Args {
    /// Certificate directory to discover nodes under (repeatable)
    #[arg(long = "cert-path", required = true)]
    cert_path: Vec<PathBuf>,

    /// Broker endpoint, e.g. mqtts://broker.example.com:443
    #[arg(long = "broker-id")]
    broker_id: String,

    /// Directory for persisted operator state
    #[arg(long = "config-dir", default_value = ".rm-fleet")]
    config_dir: PathBuf,

    /// Cap on concurrent connect calls (0 = unlimited)
    #[arg(long = "max-connections", default_value_t = 0)]
    max_connections: usize,

    /// Connect attempts per second (0 = unlimited)
    #[arg(long = "rate-limit", default_value_t = 0)]
    rate_limit: usize,

    /// Bring-up batch size (0 = all at once)
    #[arg(long = "batch-size", default_value_t = 0)]
    batch_size: usize,

    /// Global subscription slot cap
    #[arg(long = "max-subscriptions")]
    max_subscriptions: Option<usize>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("✗ Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    initialize_logging(LoggingConfig {
        level: if args.debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        },
        target: LogTarget::Stdout,
        format: LogFormat::Compact,
        ..LoggingConfig::default()
    })?;

    let (host, port) = parse_broker_endpoint(&args.broker_id)?;

    let mut config = FleetConfig::new(
        args.broker_id.clone(),
        args.cert_path.clone(),
        args.config_dir.clone(),
    );
    config.pool.max_concurrent_connections = args.max_connections;
    config.pool.connection_rate_limit = args.rate_limit;
    config.pool.batch_size = args.batch_size;
    config.max_subscriptions = args.max_subscriptions;

    println!("RM-Fleet starting...");
    println!("Certificate paths: {:?}", args.cert_path);
    println!("Broker: {}", args.broker_id);
    println!("Config directory: {}", args.config_dir.display());
    println!("{}", "-".repeat(60));

    let factory = Arc::new(MqttSessionFactory::new(SessionConfig::from_pool(
        host,
        port,
        &config.pool,
    )));
    let fleet = Fleet::bootstrap(config, factory, None).await?;

    shell(&fleet).await?;

    fleet.shutdown().await;
    println!("Goodbye");
    Ok(())
}

async fn shell(fleet: &Fleet) -> Result<()> {
    println!("Type 'help' for commands, 'exit' to quit.");
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        match handle_command(fleet, line.trim()).await {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(e) => println!("✗ {e}"),
                        }
                        prompt();
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn prompt() {
    print!("rm-fleet> ");
    let _ = std::io::stdout().flush();
}

/// Returns true when the shell should exit
async fn handle_command(fleet: &Fleet, line: &str) -> Result<bool> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = tokens.split_first() else {
        return Ok(false);
    };
    let (rest, targets) = split_targets(rest);
    let targets = targets.as_deref();

    match verb {
        "help" => print_help(),
        "exit" | "quit" => return Ok(true),
        "status" => {
            println!("{}", serde_json::to_string_pretty(&fleet.status())?);
        }
        "nodes" => {
            let nodes = fleet.pool().connected_nodes();
            if nodes.is_empty() {
                println!("No nodes connected");
            }
            for node_id in nodes {
                println!("  {node_id}");
            }
        }
        "config" => {
            let payload = json_arg(&rest, "config <json|file>")?;
            report("config", fleet.operator().send_config(targets, &payload).await);
        }
        "params" => {
            let payload = json_arg(&rest, "params <json|file>")?;
            report("params", fleet.operator().send_params(targets, &payload).await);
        }
        "init-params" => {
            let payload = json_arg(&rest, "init-params <json|file>")?;
            report(
                "init-params",
                fleet.operator().send_init_params(targets, &payload).await,
            );
        }
        "group-params" => {
            let payload = json_arg(&rest, "group-params <json|file>")?;
            report(
                "group-params",
                fleet.operator().send_group_params(targets, &payload).await,
            );
        }
        "otafetch" => {
            let fw_version = rest
                .first()
                .context("usage: otafetch <fw_version>")?;
            report(
                "otafetch",
                fleet
                    .operator()
                    .send_ota_fetch(targets, fw_version, rest.get(1).copied())
                    .await,
            );
        }
        "otastatus" => {
            let job_id = rest.first().context("usage: otastatus <job_id> <status>")?;
            let status: OtaStatus = rest
                .get(1)
                .context("usage: otastatus <job_id> <status>")?
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            report(
                "otastatus",
                fleet.operator().send_ota_status(targets, job_id, status).await,
            );
        }
        "tsdata" => {
            let payload = json_arg(&rest, "tsdata <json|file>")?;
            report("tsdata", fleet.operator().send_tsdata(targets, &payload).await);
        }
        "simple-tsdata" => {
            let payload = json_arg(&rest, "simple-tsdata <json|file>")?;
            report(
                "simple-tsdata",
                fleet.operator().send_simple_tsdata(targets, &payload).await,
            );
        }
        "map" => {
            let user_id = rest.first().context("usage: map <user_id> <secret_key>")?;
            let secret_key = rest.get(1).context("usage: map <user_id> <secret_key>")?;
            let reset = rest.contains(&"--reset");
            report(
                "map",
                fleet
                    .operator()
                    .send_user_mapping(targets, user_id, secret_key, reset, None)
                    .await,
            );
        }
        "alert" => {
            if rest.is_empty() {
                bail!("usage: alert <message>");
            }
            let message = rest.join(" ");
            report("alert", fleet.operator().send_alert(targets, &message).await);
        }
        "send-command" => {
            let request_id = rest
                .first()
                .context("usage: send-command <request_id> <role> <command> [json]")?;
            let role: u8 = rest
                .get(1)
                .context("usage: send-command <request_id> <role> <command> [json]")?
                .parse()
                .context("role must be 1, 2 or 4")?;
            let role = UserRole::try_from(role).map_err(|e| anyhow::anyhow!(e))?;
            let command: u32 = rest
                .get(2)
                .context("usage: send-command <request_id> <role> <command> [json]")?
                .parse()
                .context("command must be an integer")?;
            let mut frame = CommandFrame::new(request_id.to_string(), role, command);
            if rest.len() > 3 {
                frame = frame.with_data(parse_json_arg(&rest[3..].join(" "))?);
            }
            report(
                "send-command",
                fleet.operator().send_command_frame(targets, &frame).await,
            );
        }
        "ota-jobs" => {
            let jobs = fleet.ota().active_jobs(rest.first().copied());
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        "ota-history" => {
            let history = fleet.ota().history(rest.first().copied());
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        "clear-ota-jobs" => {
            let cleared = fleet.ota().clear_jobs(rest.first().copied());
            println!("✓ Cleared {cleared} OTA jobs");
        }
        "history" => {
            let node_id = rest.first().context("usage: history <node_id>")?;
            let entries = fleet.session_book().node_history(node_id);
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        "disconnect" => {
            let results = fleet.disconnect_nodes(targets).await;
            let done = results.values().filter(|ok| **ok).count();
            println!("✓ Disconnected {done}/{} nodes", results.len());
        }
        other => println!("Unknown command: {other} (try 'help')"),
    }
    Ok(false)
}

/// Pull an optional `--node-id a,b,c` allow-list out of the argument list
fn split_targets<'a>(args: &[&'a str]) -> (Vec<&'a str>, Option<Vec<String>>) {
    let mut rest = Vec::new();
    let mut targets = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--node-id" && i + 1 < args.len() {
            targets = Some(
                args[i + 1]
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
            i += 2;
        } else {
            rest.push(args[i]);
            i += 1;
        }
    }
    (rest, targets)
}

fn json_arg(rest: &[&str], usage: &str) -> Result<Value> {
    if rest.is_empty() {
        bail!("usage: {usage}");
    }
    parse_json_arg(&rest.join(" "))
}

/// An argument is either a path to a JSON file or inline JSON
fn parse_json_arg(arg: &str) -> Result<Value> {
    let path = std::path::Path::new(arg);
    if path.is_file() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()));
    }
    serde_json::from_str(arg).context("invalid JSON payload")
}

fn report(verb: &str, report: PublishReport) {
    println!("✓ {verb}: {}/{} nodes", report.successes(), report.total());
    for (node_id, result) in &report.results {
        if let Err(e) = result {
            println!("  ✗ {node_id}: {e}");
        }
    }
}

fn print_help() {
    println!("Commands (append --node-id a,b to limit targets):");
    println!("  status                              fleet status snapshot");
    println!("  nodes                               list connected nodes");
    println!("  config <json|file>                  push a configuration snapshot");
    println!("  params <json|file>                  push a parameter update");
    println!("  init-params <json|file>             push initial parameters");
    println!("  group-params <json|file>            push group parameters");
    println!("  otafetch <fw_version>               request an OTA update");
    println!("  otastatus <job_id> <status>         report OTA status (in-progress/success/rejected/failed/delayed)");
    println!("  ota-jobs [node]                     show active OTA jobs");
    println!("  ota-history [node]                  show completed OTA jobs");
    println!("  clear-ota-jobs [node]               clear active OTA jobs");
    println!("  tsdata <json|file>                  push time-series data");
    println!("  simple-tsdata <json|file>           push simple time-series data");
    println!("  map <user_id> <secret_key> [--reset] map a user to nodes");
    println!("  alert <message>                     send an alert");
    println!("  send-command <req> <role> <cmd> [json] send a command frame");
    println!("  history <node>                      connection history for a node");
    println!("  disconnect                          disconnect targeted nodes");
    println!("  exit                                leave the shell");
}
