use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use postdeck_api::HttpApi;
use postdeck_core::{Entity, EntityId, PostStatus, QueryContext, SortDir, SortSpec};
use postdeck_stream::{ConnectionStatus, EventStreamClient, HttpEventSource};
use postdeck_sync::{Notice, NoticeKind, SyncConfig, SyncEngine};
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "postdeckctl", version, about = "Posts dashboard sync client")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Base URL of the posts API (overrides POSTDECK_API_URL)
    #[arg(long = "api-url", global = true, env = "POSTDECK_API_URL")]
    api_url: Option<String>,

    /// Event stream URL (default: <api-url>/events)
    #[arg(long = "events-url", global = true, env = "POSTDECK_EVENTS_URL")]
    events_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug, Clone)]
struct Query {
    /// Free-text search
    #[arg(long = "search")]
    search: Option<String>,
    /// Status label filter, repeatable (e.g. "Post à valider")
    #[arg(long = "status")]
    statuses: Vec<String>,
    /// Sort key
    #[arg(long = "sort", default_value = "id")]
    sort: String,
    /// Sort ascending instead of descending
    #[arg(long = "asc", action = ArgAction::SetTrue)]
    asc: bool,
}

impl Query {
    fn context(&self) -> QueryContext {
        let dir = if self.asc { SortDir::Asc } else { SortDir::Desc };
        let mut ctx = QueryContext::default()
            .with_sort(SortSpec::new(self.sort.clone(), dir))
            .with_statuses(self.statuses.iter().map(|s| PostStatus::from(s.as_str())));
        if let Some(q) = &self.search {
            ctx = ctx.with_search(q.clone());
        }
        ctx
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load pages and print posts
    Ls {
        #[command(flatten)]
        query: Query,
        /// Keep loading pages until at least this many rows are shown
        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
    },
    /// Print change events from the stream until Ctrl-C
    Watch,
    /// Save one field of one post through the optimistic edit path
    Set {
        id: i64,
        field: String,
        /// JSON value; bare words are sent as strings
        value: String,
    },
    /// Keep a synchronized list and reprint it whenever it changes
    Live {
        #[command(flatten)]
        query: Query,
    },
}

fn init_tracing() {
    let env = std::env::var("POSTDECK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("POSTDECK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid POSTDECK_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_rows(rows: &[Arc<Entity>], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for e in rows {
                let text = e.get("text");
                let preview: String = text.as_str().unwrap_or_default().chars().take(60).collect();
                println!("{:>8}  {:<16}  {}", e.id, e.status, preview);
            }
        }
        Output::Json => {
            let items: Vec<&Entity> = rows.iter().map(|e| e.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

fn print_notice(n: &Notice) {
    match n.kind {
        NoticeKind::Error => eprintln!("error: {}", n.text),
        NoticeKind::Warn => eprintln!("warning: {}", n.text),
        NoticeKind::Info | NoticeKind::Success => eprintln!("{}", n.text),
    }
}

/// Step the engine until the pending first page settles.
async fn settle_first_page(engine: &mut SyncEngine) {
    while engine.is_loading() {
        engine.step().await;
    }
}

fn stream_client(cfg: &SyncConfig) -> Result<EventStreamClient> {
    let source = HttpEventSource::new(cfg.events_url.clone(), cfg.request_timeout)
        .with_context(|| format!("building event source for {}", cfg.events_url))?;
    Ok(EventStreamClient::new(Arc::new(source), cfg.reconnect_policy(), cfg.queue_cap))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut cfg = SyncConfig::from_env().context("reading POSTDECK_* configuration")?;
    if let Some(url) = cli.api_url {
        cfg.api_url = url.trim_end_matches('/').to_string();
        cfg.events_url = format!("{}/events", cfg.api_url);
    }
    if let Some(url) = cli.events_url {
        cfg.events_url = url;
    }
    let api = HttpApi::new(cfg.api_url.clone(), cfg.request_timeout, cfg.hard_timeout)
        .with_context(|| format!("building client for {}", cfg.api_url))?;
    let mut engine = SyncEngine::new(Arc::new(api), &cfg);
    let mut notices = engine.notices();

    match cli.command {
        Commands::Ls { query, limit } => {
            info!(limit, "ls invoked");
            engine.refresh(query.context());
            settle_first_page(&mut engine).await;
            while engine.snapshot().len() < limit && engine.load_more() {
                while engine.is_loading() {
                    engine.step().await;
                }
            }
            while let Ok(n) = notices.try_recv() {
                print_notice(&n);
            }
            let snap = engine.snapshot();
            let shown = snap.items.len().min(limit);
            print_rows(&snap.items[..shown], cli.output)?;
            if cli.output == Output::Human {
                println!("-- {} of {} (more: {})", shown, snap.total_count, snap.has_more);
            }
        }
        Commands::Watch => {
            let client = stream_client(&cfg)?;
            let mut events = client.on_entity_event();
            let mut status = client.status();
            let handle = client.connect();
            info!(url = %cfg.events_url, "watch invoked");
            loop {
                tokio::select! {
                    ev = events.recv() => match ev {
                        Ok(ev) => match cli.output {
                            Output::Human => println!("{} {} {}", ev.kind.as_str(), ev.entity_id, Value::Object(ev.patch.clone())),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(lost = n, "watch: events lagged"),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() { break; }
                        let s = *status.borrow();
                        if s != ConnectionStatus::Connecting {
                            eprintln!("[{s:?}]");
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing stream");
                        break;
                    }
                }
            }
            handle.cancel();
        }
        Commands::Set { id, field, value } => {
            let id = EntityId(id);
            let value = parse_value(&value);
            info!(entity = %id, field = %field, "set invoked");
            engine.refresh(QueryContext::default());
            settle_first_page(&mut engine).await;
            if engine.start_edit(id, &field).is_none() {
                // not on the first page; the server holds the original
                engine.start_edit_with(id, &field, Value::Null);
            }
            engine.save_edit(id, &field, value).with_context(|| format!("saving {field} on post {id}"))?;
            while engine.pending_edit(id, &field).is_some() {
                engine.step().await;
            }
            let mut failed = false;
            while let Ok(n) = notices.try_recv() {
                failed |= n.kind == NoticeKind::Error;
                print_notice(&n);
            }
            if failed {
                bail!("save of {field} on post {id} was rolled back");
            }
            if let Some(e) = engine.snapshot().get(id) {
                println!("{} {} = {}", e.id, field, e.get(&field));
            }
        }
        Commands::Live { query } => {
            let client = stream_client(&cfg)?;
            engine.attach_stream(&client);
            engine.refresh(query.context());
            let mut epochs = engine.subscribe();
            info!(api = %cfg.api_url, events = %cfg.events_url, "live invoked");
            let mut shown = 0u64;
            loop {
                tokio::select! {
                    _ = engine.step() => {
                        while let Ok(n) = notices.try_recv() {
                            print_notice(&n);
                        }
                        let epoch = *epochs.borrow_and_update();
                        if epoch != shown {
                            shown = epoch;
                            let snap = engine.snapshot();
                            if cli.output == Output::Human {
                                println!("== {} of {} [{:?}]", snap.items.len(), snap.total_count, engine.connection_status());
                            }
                            print_rows(&snap.items, cli.output)?;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down live loop");
                        break;
                    }
                }
            }
            engine.detach_stream();
            warn!("live loop ended (graceful shutdown)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_as_json_or_text() {
        assert_eq!(parse_value("42"), Value::from(42));
        assert_eq!(parse_value("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_value("Lyon"), Value::from("Lyon"));
    }

    #[test]
    fn query_flags_build_context() {
        let q = Query { search: Some("pizza".into()), statuses: vec!["Publié".into()], sort: "city".into(), asc: true };
        let ctx = q.context();
        assert_eq!(ctx.statuses, vec![PostStatus::Published]);
        assert_eq!(ctx.sort, SortSpec::new("city", SortDir::Asc));
        assert_eq!(ctx.search.as_deref(), Some("pizza"));
    }
}
