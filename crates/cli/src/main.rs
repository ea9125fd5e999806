use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kcal_api::{InProcApi, KcalApi, Settings};
use kcal_core::{time::format_timestamp, CalendarEvent, Deployment, EventSpec, Labels, Metadata, TriggerType};
use kcal_persist::MemStore;
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kcalctl", version, about = "Calendar-scheduled KEDA scaling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Keep records in memory for this invocation only (no SQLite file)
    #[arg(long = "ephemeral", global = true, action = ArgAction::SetTrue)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show API banner and namespace statistics
    Info,
    /// Calendar events and the scaling targets they own
    #[command(subcommand)]
    Events(EventCmd),
    /// Cached deployment records
    #[command(subcommand)]
    Deployments(DeploymentCmd),
    /// ScaledObjects (live from the cluster, cached copies otherwise)
    #[command(subcommand)]
    ScaledObjects(ScaledObjectCmd),
    /// Dual writes that started but never finished
    Pending,
}

#[derive(Subcommand, Debug)]
enum EventCmd {
    /// List events
    Ls,
    /// Show one event
    Get { id: String },
    /// Schedule a new event
    Create(EventArgs),
    /// Replace an event's fields (its ScaledObject is left as is)
    Update {
        id: String,
        #[command(flatten)]
        args: EventArgs,
    },
    /// Delete an event and its ScaledObject
    Rm { id: String },
}

#[derive(Args, Debug)]
struct EventArgs {
    #[arg(long)]
    title: String,
    /// ISO-8601 start, e.g. 2024-05-01T09:00:00Z
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: Option<String>,
    #[arg(long = "all-day", action = ArgAction::SetTrue)]
    all_day: bool,
    /// cron | message_queue | kafka | http | prometheus | custom
    #[arg(long = "trigger", value_parser = TriggerType::from_str)]
    trigger_type: TriggerType,
    /// Workload the ScaledObject targets
    #[arg(long = "workload")]
    target_workload: String,
    #[arg(long = "replicas", default_value_t = 1)]
    desired_replicas: u32,
    #[arg(long = "cron")]
    cron_expression: Option<String>,
    /// Trigger metadata as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_kv)]
    metadata: Vec<(String, String)>,
}

impl From<EventArgs> for EventSpec {
    fn from(a: EventArgs) -> Self {
        let metadata: Metadata = a.metadata.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect();
        EventSpec {
            title: a.title,
            start: a.start,
            end: a.end,
            all_day: a.all_day,
            trigger_type: a.trigger_type,
            target_workload: a.target_workload,
            desired_replicas: a.desired_replicas,
            cron_expression: a.cron_expression,
            metadata,
        }
    }
}

#[derive(Subcommand, Debug)]
enum DeploymentCmd {
    Ls,
    Create {
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "replicas", default_value_t = 0)]
        current_replicas: u32,
        /// Label as key=value (repeatable)
        #[arg(long = "label", value_parser = parse_kv)]
        labels: Vec<(String, String)>,
    },
}

#[derive(Subcommand, Debug)]
enum ScaledObjectCmd {
    Ls,
}

fn parse_kv(s: &str) -> Result<(String, String)> {
    let (k, v) = s.split_once('=').ok_or_else(|| anyhow!("expected key=value, got {:?}", s))?;
    if k.is_empty() {
        return Err(anyhow!("empty key in {:?}", s));
    }
    Ok((k.to_string(), v.to_string()))
}

fn init_tracing() {
    let env = std::env::var("KCAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KCAL_METRICS_ADDR; expected host:port");
        }
    }
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Human => human(value),
    }
    Ok(())
}

fn print_event(ev: &CalendarEvent) {
    let end = ev.end.as_ref().map(format_timestamp).unwrap_or_else(|| "-".to_string());
    println!(
        "{} • {} • {} → {} • {} x{} • {} • so={}",
        ev.id,
        ev.title,
        format_timestamp(&ev.start),
        end,
        ev.trigger_type,
        ev.desired_replicas,
        ev.status.as_str(),
        ev.scaling_target_id
    );
}

fn print_deployment(d: &Deployment) {
    println!("{}/{} • replicas={} • {}", d.namespace, d.name, d.current_replicas, d.id);
}

async fn run(cli: Cli, api: &dyn KcalApi) -> Result<()> {
    let out = cli.output;
    match cli.command {
        Commands::Info => {
            let about = api.about().await;
            let stats = api.namespace_stats().await?;
            let both = serde_json::json!({ "about": about, "namespace": stats });
            emit(out, &both, |_| {
                println!("{} v{}", about.message, about.version);
                println!(
                    "namespace {} • events={} (active {}) • scaled-objects={} • deployments={}",
                    stats.name, stats.total_events, stats.active_events, stats.total_scaling_targets, stats.total_deployments
                );
            })?;
        }
        Commands::Events(cmd) => match cmd {
            EventCmd::Ls => {
                let events = api.list_events().await?;
                emit(out, &events, |evs| evs.iter().for_each(print_event))?;
            }
            EventCmd::Get { id } => {
                let ev = api.get_event(&id).await?;
                emit(out, &ev, print_event)?;
            }
            EventCmd::Create(args) => {
                let ev = api.create_event(args.into()).await?;
                emit(out, &ev, print_event)?;
            }
            EventCmd::Update { id, args } => {
                let ev = api.update_event(&id, args.into()).await?;
                emit(out, &ev, print_event)?;
            }
            EventCmd::Rm { id } => {
                api.delete_event(&id).await?;
                let msg = serde_json::json!({ "message": "Event deleted successfully" });
                emit(out, &msg, |_| println!("deleted {}", id))?;
            }
        },
        Commands::Deployments(cmd) => match cmd {
            DeploymentCmd::Ls => {
                let deps = api.list_deployments().await?;
                emit(out, &deps, |ds| ds.iter().for_each(print_deployment))?;
            }
            DeploymentCmd::Create { name, namespace, current_replicas, labels } => {
                let mut d = Deployment::new(name, namespace);
                d.current_replicas = current_replicas;
                d.labels = labels.into_iter().collect::<Labels>();
                let d = api.create_deployment(d).await?;
                emit(out, &d, print_deployment)?;
            }
        },
        Commands::ScaledObjects(ScaledObjectCmd::Ls) => {
            let items = api.list_scaling_targets().await?;
            emit(out, &items, |items| {
                for st in items {
                    let types: Vec<&str> = st.triggers.iter().map(|t| t.trigger_type.as_str()).collect();
                    println!(
                        "{}/{} • target={} • replicas {}..{} • triggers={}",
                        st.namespace,
                        st.name,
                        st.target_workload,
                        st.min_replicas,
                        st.max_replicas,
                        types.join(",")
                    );
                }
            })?;
        }
        Commands::Pending => {
            let pending = api.pending_dual_writes().await?;
            emit(out, &pending, |ps| {
                for p in ps {
                    println!(
                        "{:?} • event={} • scaled-object={} • since {}",
                        p.op,
                        p.event_id,
                        p.scaling_target_id,
                        format_timestamp(&p.started_at)
                    );
                }
            })?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let api = if cli.ephemeral {
        InProcApi::with_store(Arc::new(MemStore::new()), Settings::from_env()).await
    } else {
        InProcApi::from_env().await?
    };
    info!(ns = %api.settings().namespace, cluster = api.settings().cluster_enabled, "kcalctl ready");

    if let Err(e) = run(cli, &api).await {
        error!(error = %e, "command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
