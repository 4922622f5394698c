//! Proxy Chain - CLI Entry Point
//!
//! Inspect, test and dial through configured proxy chains:
//! - `list [--json]` prints the configured hops
//! - `test <id>` checks that a hop (and its parents) connect
//! - `dial <id> <host:port>` pipes stdin/stdout through the chain
//! - `check` validates the configuration and exits

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use proxy_chain::config::{MemoryRepository, ProxyRepository};
use proxy_chain::{Config, DialContext, ProxyId, ProxyManager, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "proxy-chain")]
#[command(version = VERSION)]
#[command(about = "Dial TCP through chained SSH / SOCKS5 proxies")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured proxies
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Test that a proxy connects
    Test {
        /// Proxy id
        id: ProxyId,
    },
    /// Open a connection through a proxy and pipe stdin/stdout over it
    Dial {
        /// Proxy id (0 = direct)
        id: ProxyId,
        /// Target host:port
        address: String,
    },
    /// Validate configuration and exit
    Check,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("proxy-chain-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn").add_directive(format!("proxy_chain={}", level).parse()?),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::load_async(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    init_logging(config.log_level.as_deref().unwrap_or("info"), args.json_logs)?;
    info!("Proxy Chain v{}", VERSION);
    info!("Loaded {} proxies from {}", config.proxies.len(), args.config.display());

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo.clone(), config.dialer.clone());

    let ctx = DialContext::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, cancelling");
                ctx.cancel();
            }
        });
    }

    let result = run(&args.command, &ctx, &manager, repo.as_ref()).await;

    if let Err(e) = manager.shutdown().await {
        error!("Shutdown error: {}", e);
    }

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    command: &Command,
    ctx: &DialContext,
    manager: &ProxyManager,
    repo: &dyn ProxyRepository,
) -> proxy_chain::Result<()> {
    match command {
        Command::Check => {
            println!("configuration OK");
            Ok(())
        }
        Command::List { json } => {
            let mut proxies = repo.list().await?;
            if *json {
                for p in &mut proxies {
                    if p.password.is_some() {
                        p.password = Some("******".to_string());
                    }
                }
                let out = serde_json::to_string_pretty(&proxies)
                    .map_err(|e| proxy_chain::Error::config(e.to_string()))?;
                println!("{}", out);
                return Ok(());
            }
            for p in proxies {
                println!(
                    "{:>4}  {:<20} {:<7} {:<28} parent={:<4} enabled={:<5} status={}",
                    p.id,
                    p.label(),
                    p.proxy_type.to_string(),
                    p.address(),
                    p.parent().unwrap_or(0),
                    p.enabled,
                    p.status
                );
            }
            Ok(())
        }
        Command::Test { id } => {
            manager.test_proxy(ctx, *id).await?;
            println!("proxy {} OK", id);
            Ok(())
        }
        Command::Dial { id, address } => {
            let dialer = manager.get_dialer(ctx, *id).await?;
            let conn = dialer.dial(ctx, "tcp", address).await?;
            info!("Connected to {} via {}", address, dialer.name());

            let (mut remote_rd, mut remote_wr) = tokio::io::split(conn);
            let mut stdin = tokio::io::stdin();
            let mut stdout = tokio::io::stdout();

            let upstream = async {
                let sent = tokio::io::copy(&mut stdin, &mut remote_wr).await?;
                tokio::io::AsyncWriteExt::shutdown(&mut remote_wr).await?;
                Ok::<u64, std::io::Error>(sent)
            };
            let downstream = tokio::io::copy(&mut remote_rd, &mut stdout);

            tokio::select! {
                _ = ctx.cancelled() => Err(proxy_chain::Error::Cancelled),
                res = async { tokio::try_join!(upstream, downstream) } => {
                    let (sent, received) = res?;
                    info!("Closed: {} bytes sent, {} bytes received", sent, received);
                    Ok(())
                }
            }
        }
    }
}
