mod auth;
mod client;
mod config;
mod controller;
mod egress;
mod error;
mod heartbeat;
mod honeytoken;
mod inhibit;
mod process;
mod serve;
mod signals;
mod status;
mod watchdog;

use clap::{Parser, Subcommand};
use config::GuardianConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Fail-closed containment for a supervised workload: an out-of-band
/// controller owns the inhibit flag, a watchdog keeps the workload running
/// only while the controller says so, and detectors report violations.
#[derive(Parser, Debug)]
#[command(name = "guardian", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "guardian.toml", global = true)]
    config: PathBuf,

    /// Debug logging (poll results, heartbeats, request traces)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the safety controller (inhibit flag + heartbeat registry)
    Controller {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Auto-clear an inhibit after this many seconds (0 disables)
        #[arg(long)]
        auto_clear: Option<f64>,
    },
    /// Supervise the workload; stop it whenever the controller can't confirm "not inhibited"
    Watchdog {
        /// Controller base URL (overrides config)
        #[arg(long)]
        controller_url: Option<String>,
        /// Agent identity for heartbeats (overrides config)
        #[arg(long)]
        agent: Option<String>,
        /// Workload command and arguments (overrides config)
        #[arg(last = true)]
        workload: Vec<String>,
    },
    /// Run the egress allow-list gateway
    Egress {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Allowed hostnames, comma-separated (overrides config)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,
    },
    /// Run the honeytoken trap
    Honeytoken {
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Decoy file path (overrides config)
        #[arg(long)]
        decoy_file: Option<PathBuf>,
    },
}

impl Command {
    /// Apply CLI flags on top of file + environment config.
    fn apply_overrides(&self, config: &mut GuardianConfig) {
        match self {
            Command::Controller { port, auto_clear } => {
                if let Some(port) = port {
                    config.controller.port = *port;
                }
                if let Some(secs) = auto_clear {
                    config.controller.auto_clear_secs = *secs;
                }
            }
            Command::Watchdog {
                controller_url,
                agent,
                workload,
            } => {
                if let Some(url) = controller_url {
                    config.controller.url = url.clone();
                }
                if let Some(agent) = agent {
                    config.watchdog.agent = agent.clone();
                }
                if let Some((command, args)) = workload.split_first() {
                    config.workload.command = command.clone();
                    config.workload.args = args.to_vec();
                }
            }
            Command::Egress { port, allow } => {
                if let Some(port) = port {
                    config.egress.port = *port;
                }
                if !allow.is_empty() {
                    config.egress.allowed_domains = allow.clone();
                }
            }
            Command::Honeytoken { port, decoy_file } => {
                if let Some(port) = port {
                    config.honeytoken.port = *port;
                }
                if let Some(path) = decoy_file {
                    config.honeytoken.decoy_file = path.clone();
                }
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "guardian=debug,tower_http=debug"
    } else {
        "guardian=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Print the resolved config with the shared secret masked.
fn print_resolved(config: &GuardianConfig) {
    let mut shown = config.clone();
    if shown.auth.secret().is_some() {
        shown.auth.token = "********".to_string();
    }
    match toml::to_string_pretty(&shown) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "failed to render config"),
    }
}

async fn run_watchdog(config: &GuardianConfig) -> i32 {
    let client = match client::ControllerClient::new(
        &config.controller.url,
        config.watchdog.request_timeout(),
        &config.auth,
    ) {
        Ok(c) => c,
        Err(e) => {
            // Without a client the workload can never be confirmed safe.
            tracing::error!(error = %e, "cannot build controller client; fail-closed");
            return 1;
        }
    };
    let process = process::SupervisedProcess::from_config(&config.workload);
    let watchdog = watchdog::Watchdog::new(client, config.watchdog.clone(), process);
    let outcome = watchdog.run(signals::shutdown_signal()).await;
    tracing::info!(?outcome, "watchdog finished");
    outcome.exit_code()
}

fn exit_code<E: std::fmt::Display>(service: &str, result: Result<(), E>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(service, error = %e, "service failed");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match GuardianConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    cli.command.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }

    if cli.dry_run {
        print_resolved(&config);
        return;
    }

    let code = match cli.command {
        Command::Controller { .. } => exit_code("controller", controller::run(&config).await),
        Command::Watchdog { .. } => run_watchdog(&config).await,
        Command::Egress { .. } => exit_code("egress", egress::run(&config).await),
        Command::Honeytoken { .. } => exit_code("honeytoken", honeytoken::run(&config).await),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_watchdog_workload_after_double_dash() {
        let cli = parse(&["guardian", "watchdog", "--agent", "ai-1", "--", "python3", "-c", "pass"]);
        let mut config = GuardianConfig::default();
        cli.command.apply_overrides(&mut config);
        assert_eq!(config.watchdog.agent, "ai-1");
        assert_eq!(config.workload.command, "python3");
        assert_eq!(config.workload.args, vec!["-c", "pass"]);
    }

    #[test]
    fn test_watchdog_without_workload_keeps_config() {
        let cli = parse(&["guardian", "watchdog"]);
        let mut config = GuardianConfig::default();
        cli.command.apply_overrides(&mut config);
        assert_eq!(config.workload.command, "sleep");
    }

    #[test]
    fn test_egress_allow_list_override() {
        let cli = parse(&["guardian", "egress", "--allow", "httpbin.org,api.github.com", "--port", "9200"]);
        let mut config = GuardianConfig::default();
        cli.command.apply_overrides(&mut config);
        config.validate().unwrap();
        assert_eq!(config.egress.port, 9200);
        assert_eq!(
            config.egress.allowed_domains,
            vec!["httpbin.org", "api.github.com"]
        );
    }

    #[test]
    fn test_controller_auto_clear_override() {
        let cli = parse(&["guardian", "--dry-run", "controller", "--auto-clear", "10"]);
        assert!(cli.dry_run);
        let mut config = GuardianConfig::default();
        cli.command.apply_overrides(&mut config);
        assert_eq!(
            config.controller.auto_clear(),
            Some(std::time::Duration::from_secs(10))
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["guardian", "honeytoken", "-v", "--config", "alt.toml", "--decoy-file", "d.txt"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        let mut config = GuardianConfig::default();
        cli.command.apply_overrides(&mut config);
        assert_eq!(config.honeytoken.decoy_file, PathBuf::from("d.txt"));
    }

    #[test]
    fn test_resolved_config_renders_as_toml() {
        let config = GuardianConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: GuardianConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.controller.port, config.controller.port);
    }
}
