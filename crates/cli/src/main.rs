use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use shadow_api::{CompositeStore, ListOptions, RequestCtx, Settings, ShadowStorage, Table, TableOptions, TableSource};
use shadow_core::ShadowResource;
use shadow_kubehub::{DiscoveryResolver, KubeObjectStore};
use shadow_registry::WatchRegistry;
use shadow_schema::StatusPaths;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "shadowctl", version, about = "Shadow resource orchestrator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true, env = "SHADOW_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or replace a shadow resource from a YAML/JSON manifest
    Create {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Show a shadow resource with its live components
    Get { name: String },
    /// List shadow resources in the namespace
    Ls {
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Delete a shadow resource and its components
    Delete { name: String },
    /// Tabular view of one shadow resource, or all of them
    Table {
        name: Option<String>,
        #[arg(long = "no-headers", action = ArgAction::SetTrue)]
        no_headers: bool,
    },
    /// Rehydrate watches for existing records and propagate status until interrupted
    Serve,
}

fn init_tracing() {
    let env = std::env::var("SHADOW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SHADOW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SHADOW_METRICS_ADDR; expected host:port");
        }
    }
}

/// Render a table with left-aligned, space-padded columns.
fn render_table(t: &Table) -> String {
    let headers: Vec<String> = t.column_definitions.iter().map(|c| c.name.to_uppercase()).collect();
    let ncols = t.rows.iter().map(|r| r.cells.len()).chain(std::iter::once(headers.len())).max().unwrap_or(0);
    let mut widths = vec![0usize; ncols];
    for row in std::iter::once(&headers).chain(t.rows.iter().map(|r| &r.cells)) {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in std::iter::once(&headers).filter(|h| !h.is_empty()).chain(t.rows.iter().map(|r| &r.cells)) {
        let line: Vec<String> = row.iter().enumerate().map(|(i, c)| format!("{:<w$}", c, w = widths[i])).collect();
        out.push_str(line.join("   ").trim_end());
        out.push('\n');
    }
    out
}

fn component_line(c: &serde_json::Value) -> String {
    let field = |v: Option<&serde_json::Value>| v.and_then(|s| s.as_str()).unwrap_or("-").to_string();
    let meta = c.get("metadata");
    let ns = field(meta.and_then(|m| m.get("namespace")));
    format!(
        "{}/{} {}/{}",
        field(c.get("apiVersion")),
        field(c.get("kind")),
        ns,
        field(meta.and_then(|m| m.get("name")))
    )
}

struct Runtime {
    api: CompositeStore,
    namespace: String,
}

async fn connect(ns_flag: Option<String>) -> Result<Runtime> {
    let client = shadow_kubehub::get_kube_client().await.context("creating kube client")?;
    let namespace = ns_flag.unwrap_or_else(|| client.default_namespace().to_string());
    let resolver = DiscoveryResolver::new(client).await?;
    let store = Arc::new(KubeObjectStore::try_default().await?);
    let settings = Settings::from_env();
    settings.validate()?;
    let paths = Arc::new(StatusPaths::from_env());
    let registry = Arc::new(
        WatchRegistry::new(store.clone(), paths.clone(), settings.record_type.clone())
            .with_field_manager(settings.field_manager.clone()),
    );
    let api = CompositeStore::new(store, Arc::new(resolver), registry, paths, settings);
    Ok(Runtime { api, namespace })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                token.cancel();
            }
        });
    }
    let ctx = RequestCtx::new().with_token(shutdown.clone());
    let rt = connect(cli.namespace.clone()).await?;
    let ns = rt.namespace.as_str();

    match cli.command {
        Commands::Create { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let json = shadow_apply::manifest_to_json(&text)?;
            let obj: ShadowResource = serde_json::from_value(json).context("decoding ShadowResource")?;
            info!(ns = %ns, name = %obj.name(), file = %file.display(), "create invoked");
            let out = rt.api.create(&ctx, ns, obj).await?;
            match cli.output {
                Output::Human => println!("shadowresource/{} applied ({} components)", out.name(), out.spec.flow_list.len()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Get { name } => {
            let obj = rt.api.get(&ctx, ns, &name).await?;
            match cli.output {
                Output::Human => {
                    println!("Name:      {}", obj.name());
                    println!("Namespace: {}", obj.namespace());
                    println!("Status:    {}", obj.status.state);
                    println!("Uid:       {}", obj.metadata.uid.as_deref().unwrap_or("-"));
                    println!("Components:");
                    for c in &obj.spec.flow_list {
                        println!("  {}", component_line(c));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
            }
        }
        Commands::Ls { limit } => {
            let list = rt.api.list(&ctx, ns, &ListOptions { limit }).await?;
            match cli.output {
                Output::Human => {
                    let table = rt.api.convert_to_table(TableSource::List(&list), &TableOptions::default());
                    print!("{}", render_table(&table));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::Delete { name } => {
            let (stub, _) = rt.api.delete(&ctx, ns, &name).await?;
            match cli.output {
                Output::Human => println!("shadowresource/{} deleted", stub.name()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&stub)?),
            }
        }
        Commands::Table { name, no_headers } => {
            let opts = TableOptions { no_headers };
            let table = match name {
                Some(name) => {
                    let obj = rt.api.get(&ctx, ns, &name).await?;
                    rt.api.convert_to_table(TableSource::Single(&obj), &opts)
                }
                None => {
                    let list = rt.api.list(&ctx, ns, &ListOptions::default()).await?;
                    rt.api.convert_to_table(TableSource::List(&list), &opts)
                }
            };
            match cli.output {
                Output::Human => print!("{}", render_table(&table)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&table)?),
            }
        }
        Commands::Serve => {
            match rt.api.registry().rehydrate().await {
                Ok(n) => info!(records = n, watches = rt.api.registry().watched().len(), "serving"),
                Err(e) => {
                    error!(error = %e, "rehydrate failed");
                    return Err(e.into());
                }
            }
            shutdown.cancelled().await;
            info!("shutting down");
        }
    }
    Ok(())
}
