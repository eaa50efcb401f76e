use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use o2ims_alarms::alertmanager::{self, AlertmanagerClient, ReceiverSettings};
use o2ims_alarms::infrastructure::RESYNC_INTERVAL;
use o2ims_alarms::service_config::CLEANUP_INTERVAL;
use o2ims_alarms::{AlarmsServer, AlertmanagerConfig, ClusterServerClient, DispatcherConfig, InfrastructureCache, ServerOptions};
use o2ims_core::{CancellationToken, Object};
use o2ims_kubehub::ConfigMapStore;
use o2ims_persist::{KvStore, MemoryStore};
use o2ims_search::{parse_selectors, Projector, Selector};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "o2imsctl", version, about = "O2IMS alarms server and tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the alarms server
    Serve(ServeArgs),
    /// Apply a selector and projector to JSON read from a file or stdin
    Filter {
        /// Selector expression, repeatable; terms are ANDed
        #[arg(long = "selector")]
        selector: Vec<String>,
        /// Comma-separated paths to keep
        #[arg(long = "fields")]
        fields: Vec<String>,
        /// Comma-separated paths to drop
        #[arg(long = "exclude-fields")]
        exclude_fields: Vec<String>,
        /// Input file; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Merge the ORAN receiver into an Alertmanager config
    AmConfig {
        /// Read the config from this file and print the merged result
        #[arg(long = "file", conflicts_with = "secret")]
        file: Option<PathBuf>,
        /// Read the in-cluster Secret and write the merged config back
        #[arg(long = "secret", action = ArgAction::SetTrue)]
        secret: bool,
        /// Base URL Alertmanager uses to reach the webhook
        #[arg(long = "alarm-server-url", env = "O2IMS_ALARM_SERVER_URL", default_value = DEFAULT_ALARM_SERVER_URL)]
        alarm_server_url: String,
    },
}

const DEFAULT_ALARM_SERVER_URL: &str = "https://alarms-server.oran-o2ims.svc.cluster.local:8000";

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long = "listen", env = "O2IMS_LISTEN", default_value = "0.0.0.0:8000")]
    listen: String,
    /// Scheme and host used in generated links
    #[arg(long = "external-address", env = "O2IMS_EXTERNAL_ADDRESS")]
    external_address: Option<String>,
    #[arg(long = "namespace", env = "O2IMS_NAMESPACE", default_value = "oran-o2ims")]
    namespace: String,
    #[arg(long = "subscriptions-configmap", env = "O2IMS_SUBSCRIPTIONS_CONFIGMAP", default_value = "oran-o2ims-alarms-subscriptions")]
    subscriptions_configmap: String,
    /// Keep subscriptions in memory instead of the ConfigMap
    #[arg(long = "in-memory", action = ArgAction::SetTrue)]
    in_memory: bool,
    #[arg(long = "cluster-server-url", env = "CLUSTER_SERVER_URL")]
    cluster_server_url: Option<String>,
    #[arg(long = "token-file", env = "TOKEN_PATH", default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token")]
    token_file: PathBuf,
    #[arg(long = "alert-sync-interval-secs", env = "O2IMS_ALERT_SYNC_INTERVAL_SECS", default_value_t = 60)]
    alert_sync_interval_secs: u64,
    #[arg(long = "notify-timeout-secs", env = "O2IMS_NOTIFY_TIMEOUT_SECS", default_value_t = 2)]
    notify_timeout_secs: u64,
    /// Base URL Alertmanager uses to reach the webhook
    #[arg(long = "alarm-server-url", env = "O2IMS_ALARM_SERVER_URL", default_value = DEFAULT_ALARM_SERVER_URL)]
    alarm_server_url: String,
    /// Skip the Alertmanager Secret merge and the periodic pull
    #[arg(long = "no-alertmanager", action = ArgAction::SetTrue)]
    no_alertmanager: bool,
}

fn init_tracing() {
    let env = std::env::var("O2IMS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("O2IMS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid O2IMS_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cancel = CancellationToken::new();

    let store: Arc<dyn KvStore> = if args.in_memory {
        info!("subscriptions: in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let cm = Arc::new(ConfigMapStore::connect(&args.namespace, &args.subscriptions_configmap).await?);
        cm.spawn_watch(cancel.clone());
        info!(ns = %args.namespace, name = %cm.name(), "subscriptions: configmap store");
        cm
    };

    let infrastructure = match &args.cluster_server_url {
        Some(url) => {
            let client = ClusterServerClient::from_token_file(url, &args.token_file)?;
            let cache = Arc::new(InfrastructureCache::new(Arc::new(client)));
            cache.spawn_sync(cancel.clone(), RESYNC_INTERVAL);
            Some(cache)
        }
        None => {
            warn!("no cluster server url; alarms will not carry resource types or definitions");
            None
        }
    };

    let opts = ServerOptions {
        dispatcher: DispatcherConfig { timeout: Duration::from_secs(args.notify_timeout_secs), ..Default::default() },
        external_address: args.external_address.clone(),
        infrastructure,
    };
    let server = AlarmsServer::new(store, opts)?;
    server.subscriptions.rehydrate().await?;
    server.subscriptions.spawn_resync(cancel.clone());
    server.service_config.spawn_cleanup(CLEANUP_INTERVAL, cancel.clone());

    if !args.no_alertmanager {
        let am_cfg = AlertmanagerConfig::from_env(&args.alarm_server_url, Duration::from_secs(args.alert_sync_interval_secs));
        if !args.in_memory {
            let kube = kube::Client::try_default().await.context("building kube client")?;
            if let Err(e) = alertmanager::setup(kube, &ReceiverSettings::for_config(&am_cfg)).await {
                error!(error = %e, "alertmanager setup failed; webhook pushes may not arrive");
            }
        }
        let interval = am_cfg.sync_interval;
        let client = Arc::new(AlertmanagerClient::new(am_cfg)?);
        server.pipeline.spawn_sync_scheduler(client, interval, cancel.clone());
    }

    let listener = TcpListener::bind(&args.listen).await.with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %args.listen, "alarms server listening");
    axum::serve(listener, server.router()).with_graceful_shutdown(shutdown(cancel.clone())).await?;
    cancel.cancel();
    info!("alarms server stopped");
    Ok(())
}

fn read_input(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn shape(object: &Object, selector: Option<&Selector>, projector: &Projector) -> Result<Option<Value>> {
    if let Some(sel) = selector {
        if !sel.matches(object)? { return Ok(None); }
    }
    Ok(Some(Value::Object(projector.apply(object))))
}

fn filter(selector: &[String], fields: &[String], exclude: &[String], file: Option<&PathBuf>) -> Result<()> {
    let selector = parse_selectors(selector)?;
    let projector = Projector::parse(fields, exclude)?;
    let input: Value = serde_json::from_str(&read_input(file)?).context("input is not JSON")?;
    let out = match input {
        Value::Array(items) => {
            let mut kept = Vec::new();
            for item in items {
                let Value::Object(obj) = item else { bail!("array items must be objects") };
                if let Some(v) = shape(&obj, selector.as_ref(), &projector)? { kept.push(v); }
            }
            Value::Array(kept)
        }
        Value::Object(obj) => shape(&obj, selector.as_ref(), &projector)?.unwrap_or(Value::Null),
        other => bail!("expected a JSON array or object, got {}", o2ims_core::json_type_name(&other)),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn am_config(file: Option<PathBuf>, secret: bool, alarm_server_url: &str) -> Result<()> {
    let cfg = AlertmanagerConfig::from_env(alarm_server_url, Duration::from_secs(60));
    let settings = ReceiverSettings::for_config(&cfg);
    if secret {
        let kube = kube::Client::try_default().await.context("building kube client")?;
        return alertmanager::setup(kube, &settings).await;
    }
    let path = file.ok_or_else(|| anyhow!("either --file or --secret is required"))?;
    let existing = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let merged = alertmanager::add_oran_route_to_config(&existing, &settings)?;
    print!("{}", alertmanager::render(&merged)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Filter { selector, fields, exclude_fields, file } => filter(&selector, &fields, &exclude_fields, file.as_ref()),
        Commands::AmConfig { file, secret, alarm_server_url } => am_config(file, secret, &alarm_server_url).await,
    }
}
