use crate::config::settings::Config;
use crate::config::types::RawRequest;
use crate::config::validator::validate_config;
use crate::core::SessionOrchestrator;
use crate::network::SystemResolver;
use crate::observability::audit::{AuditLog, EventSink, LogSink, DEFAULT_QUEUE_CAPACITY};
use crate::runtime::{DockerRuntime, IptablesFirewall};
use crate::session::SessionView;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $SESSIONBOX_CONFIG, then ./sessionbox.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new sandbox session
    Start(StartArgs),
    /// Stop a session, keeping it resumable
    Stop { name: String },
    /// List sessions reconciled against the runtime
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one session, or the most recent running one
    Status {
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Remove a session's instance, volume and record
    Destroy { name: String },
    /// Stop idle and memory-exhausted sessions now
    Reap,
    /// Remove exited instances and their unreferenced volumes
    Gc,
    /// Compare a session's applied isolation with its policy
    Verify {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Run the lifecycle monitor
    Monitor {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Print Prometheus metrics after the cycle (with --once)
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Args)]
struct StartArgs {
    /// Session name (generated when omitted)
    #[arg(long)]
    name: Option<String>,
    /// cli or desktop
    #[arg(long, default_value = "cli")]
    mode: String,
    /// none, host or filtered
    #[arg(long, default_value = "none")]
    network: String,
    /// Access tier for filtered networking (free, basic, pro, dev, founder, admin)
    #[arg(long)]
    tier: Option<String>,
    /// CPU limit in cores
    #[arg(long, default_value = "2")]
    cpus: String,
    /// Memory limit (e.g. 512m, 4g)
    #[arg(long, default_value = "4g")]
    memory: String,
    #[arg(long)]
    gpu: bool,
    /// Remove the session when it exits
    #[arg(long)]
    ephemeral: bool,
    /// Keep a durable home volume across restarts
    #[arg(long)]
    persist: bool,
    /// Bind mount (format: source=target[:ro|rw])
    #[arg(long = "mount", value_name = "MOUNT")]
    mounts: Vec<String>,
    /// Published port (format: [host:]container[/tcp|udp])
    #[arg(long = "port", value_name = "PORT")]
    ports: Vec<String>,
    /// Environment variable (format: KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Image override
    #[arg(long)]
    image: Option<String>,
    /// Idle timeout override in minutes
    #[arg(long)]
    idle_timeout: Option<String>,
}

impl StartArgs {
    fn request(&self) -> RawRequest {
        RawRequest {
            mode: self.mode.clone(),
            network: self.network.clone(),
            tier: self.tier.clone(),
            cpus: self.cpus.clone(),
            memory: self.memory.clone(),
            gpu: self.gpu,
            ephemeral: self.ephemeral,
            persist: self.persist,
            mounts: self.mounts.clone(),
            ports: self.ports.clone(),
            env: self.env.clone(),
            image: self.image.clone(),
            idle_timeout_minutes: self.idle_timeout.clone(),
        }
    }
}

fn event_sink(config: &Config) -> Arc<dyn EventSink> {
    let Some(path) = &config.audit_log else {
        return Arc::new(LogSink);
    };
    match AuditLog::open(path, DEFAULT_QUEUE_CAPACITY) {
        Ok(audit) => Arc::new(audit),
        Err(e) => {
            log::warn!("Audit log unavailable, logging events only: {}", e);
            Arc::new(LogSink)
        }
    }
}

fn print_views(views: &[SessionView]) {
    if views.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:<28} {:<9} {:<8} {:<10} {}",
        "NAME", "STATUS", "MODE", "NETWORK", "CREATED"
    );
    for view in views {
        let network = view
            .record
            .as_ref()
            .map(|r| r.request.network.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<9} {:<8} {:<10} {}",
            view.name,
            view.status.as_str(),
            view.mode().map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
            network,
            view.created_at()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        anyhow::bail!("sessionbox requires a Unix-like host");
    }

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let validation = validate_config(&config)?;
    log::debug!(
        "Config validated with {} warning(s)",
        validation.warnings.len()
    );
    let config = Arc::new(config);

    let events = event_sink(&config);
    let orchestrator = SessionOrchestrator::new(
        Arc::clone(&config),
        Arc::new(DockerRuntime::new(&config.runtime)),
        Arc::new(IptablesFirewall::new(&config.firewall)),
        Arc::new(SystemResolver),
        events,
    );

    match cli.command {
        Commands::Start(args) => {
            let outcome = orchestrator.start(&args.request(), args.name.as_deref())?;
            for warning in &outcome.warnings {
                eprintln!("Warning: {}", warning);
            }
            match outcome.launch.exit_code {
                Some(code) => println!("Session {} exited with code {}", outcome.session.name, code),
                None => println!("Session {} started", outcome.session.name),
            }
            if let Some(address) = outcome.launch.address {
                println!(
                    "Address {} ({} firewall rule(s))",
                    address, outcome.launch.rules_applied
                );
            }
            Ok(())
        }
        Commands::Stop { name } => {
            orchestrator.stop(&name)?;
            println!("Session {} stopped", name);
            Ok(())
        }
        Commands::List { json } => {
            let views = orchestrator.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else {
                print_views(&views);
            }
            Ok(())
        }
        Commands::Status { name, json } => {
            let view = orchestrator.status(name.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_views(std::slice::from_ref(&view));
                if let Some(info) = &view.instance {
                    println!(
                        "instance={} state={} restarts={} oom_killed={}",
                        info.id, info.state, info.restart_count, info.oom_killed
                    );
                }
            }
            Ok(())
        }
        Commands::Destroy { name } => {
            let report = orchestrator.destroy(&name)?;
            println!(
                "Session {} destroyed (instance: {}, volume: {}, record: {})",
                name,
                report.instance,
                report.volume.as_deref().unwrap_or("none"),
                report.record
            );
            Ok(())
        }
        Commands::Reap => {
            let decisions = orchestrator.reap()?;
            if decisions.is_empty() {
                println!("Nothing to reap");
            }
            for decision in decisions {
                println!(
                    "{} {} metric={} threshold={}",
                    decision.action,
                    decision.session,
                    decision.metric.map(|m| format!("{:.2}", m)).unwrap_or_else(|| "-".to_string()),
                    decision.threshold.map(|t| format!("{:.2}", t)).unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }
        Commands::Gc => {
            let plan = orchestrator.gc()?;
            println!(
                "Removed {} instance(s), {} volume(s), {} record(s)",
                plan.instances.len(),
                plan.volumes.len(),
                plan.records.len()
            );
            Ok(())
        }
        Commands::Verify { name, json } => {
            let report = orchestrator.verify(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for check in &report.checks {
                    println!("{:<18} {:?} {}", check.check.as_str(), check.outcome, check.detail);
                }
            }
            if let Some(warning) = report.warning() {
                eprintln!("Warning: {}", warning);
            }
            Ok(())
        }
        Commands::Monitor { once, metrics } => {
            if !once {
                orchestrator.monitor_forever();
            }
            let report = orchestrator
                .monitor_once()
                .context("monitor cycle failed")?;
            println!(
                "{} live session(s), {} decision(s)",
                report.live,
                report.decisions.len()
            );
            if metrics {
                print!("{}", orchestrator.metrics().export_prometheus());
            }
            Ok(())
        }
    }
}
