//! Tidepool: realtime sync engine harness
//!
//! Subcommands:
//! - `watch`: acquire domains against a Supabase project and log cache
//!   activity (updates, invalidations, evictions)
//! - `tail`: follow one conversation stream; stdin lines are sent as
//!   messages

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidepool::{CONVERSATIONS_DOMAIN, CacheEvent, EngineConfig, Role, StreamKey, SyncEngine};
use tidepool_supabase::{RealtimeSocket, SupabaseClient};

/// Consumer tuning profile.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Profile {
    /// Ordinary views.
    Default,
    /// Metric-heavy screens: tighter coalescing.
    Dashboard,
    /// Low-priority views: wide coalescing, slow polling.
    Background,
}

impl Profile {
    fn config(self) -> EngineConfig {
        match self {
            Profile::Default => EngineConfig::default(),
            Profile::Dashboard => EngineConfig::dashboard(),
            Profile::Background => EngineConfig::background(),
        }
    }
}

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(about = "Realtime sync and cache-consistency engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch domains and log cache activity
    Watch {
        /// Supabase project URL
        #[arg(long, env = "TIDEPOOL_SUPABASE_URL")]
        supabase_url: String,

        /// Supabase anon key
        #[arg(long, env = "TIDEPOOL_SUPABASE_KEY")]
        supabase_key: String,

        /// Realtime websocket URL (defaults to the project's endpoint)
        #[arg(long, env = "TIDEPOOL_REALTIME_URL")]
        realtime_url: Option<String>,

        /// Tuning profile
        #[arg(long, value_enum, default_value = "default")]
        profile: Profile,

        /// Domains to acquire
        #[arg(value_name = "DOMAIN", required = true)]
        domains: Vec<String>,
    },

    /// Follow one conversation stream; stdin lines are sent as messages
    Tail {
        /// Supabase project URL
        #[arg(long, env = "TIDEPOOL_SUPABASE_URL")]
        supabase_url: String,

        /// Supabase anon key
        #[arg(long, env = "TIDEPOOL_SUPABASE_KEY")]
        supabase_key: String,

        /// Realtime websocket URL (defaults to the project's endpoint)
        #[arg(long, env = "TIDEPOOL_REALTIME_URL")]
        realtime_url: Option<String>,

        /// Tuning profile
        #[arg(long, value_enum, default_value = "default")]
        profile: Profile,

        /// Conversation session id
        #[arg(value_name = "SESSION")]
        session: String,
    },
}

fn realtime_endpoint(supabase_url: &str, realtime_url: Option<String>) -> String {
    realtime_url.unwrap_or_else(|| {
        format!(
            "{}/realtime/v1/websocket",
            supabase_url.replacen("https", "wss", 1)
        )
    })
}

fn build_engine(
    supabase_url: &str,
    supabase_key: &str,
    realtime_url: Option<String>,
    profile: Profile,
) -> Arc<SyncEngine> {
    let client = Arc::new(SupabaseClient::new(supabase_url, supabase_key));
    let socket = Arc::new(RealtimeSocket::new(
        realtime_endpoint(supabase_url, realtime_url),
        supabase_key,
    ));
    SyncEngine::builder(client, socket)
        .config(profile.config())
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tidepool=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            supabase_url,
            supabase_key,
            realtime_url,
            profile,
            domains,
        } => {
            let engine = build_engine(&supabase_url, &supabase_key, realtime_url, profile);
            run_watch(engine, domains).await
        }

        Commands::Tail {
            supabase_url,
            supabase_key,
            realtime_url,
            profile,
            session,
        } => {
            let engine = build_engine(&supabase_url, &supabase_key, realtime_url, profile);
            run_tail(engine, session).await
        }
    }
}

async fn run_watch(engine: Arc<SyncEngine>, domains: Vec<String>) -> Result<()> {
    let handles: Vec<_> = domains
        .iter()
        .map(|domain| engine.acquire(domain.as_str()))
        .collect();
    info!(domains = ?domains, "watching");

    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(CacheEvent::Updated { key }) => println!("updated      {}", key),
                Ok(CacheEvent::Invalidated { key }) => println!("invalidated  {}", key),
                Ok(CacheEvent::Evicted { key }) => println!("evicted      {}", key),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "lagged behind cache events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    for handle in &handles {
        handle.release();
    }
    engine.shutdown();
    Ok(())
}

async fn run_tail(engine: Arc<SyncEngine>, session: String) -> Result<()> {
    let stream = engine.open_stream(StreamKey::new(CONVERSATIONS_DOMAIN, session));
    stream
        .load_initial()
        .await
        .map_err(|e| miette::miette!("initial load failed: {}", e))?;

    let mut snapshots = WatchStream::new(stream.watch());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Items already written out; reconciliation rewrites in place and
    // rollback shrinks the sequence, so clamp before printing.
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => {
                    printed = printed.min(snapshot.items.len());
                    for item in snapshot.items.iter().skip(printed) {
                        let marker = if item.pending { "…" } else { " " };
                        println!(
                            "{} [{}] {}: {}",
                            marker,
                            item.sent_at.format("%H:%M:%S"),
                            role_label(item.role),
                            item.content
                        );
                    }
                    printed = snapshot.items.len();
                }
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = stream.send(Role::User, line.trim().to_string()).await {
                        warn!(error = %e, "send failed");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stdin error");
                    break;
                }
            }
        }
    }

    stream.dispose();
    engine.shutdown();
    Ok(())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}
