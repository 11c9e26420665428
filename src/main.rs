//! OpenMind Peer - command-line entry point
//!
//! `signal` hosts the rendezvous, `serve` donates a local model, `ask`
//! streams a completion from a donor and `peers` lists who is online.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info};

use openmind_peer::backend::{MockBackend, OllamaBackend, OllamaConfig, SharedBackend};
use openmind_peer::cli::{BackendKind, Cli, Commands, ConfigSubcommand};
use openmind_peer::config::{self, PeerConfig};
use openmind_peer::context::PromptContext;
use openmind_peer::donor::{DonorConfig, DonorService};
use openmind_peer::error::Error;
use openmind_peer::negotiator::{Negotiator, NegotiatorConfig};
use openmind_peer::rendezvous::{PeerDirectory, RendezvousClient, RendezvousStore, SharedRendezvous, SignalServer};
use openmind_peer::stream::StreamMultiplexer;
use openmind_peer::transport::{TcpTransportConfig, TcpTransportFactory};
use openmind_peer::{identity, logging, version};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        match e.downcast_ref::<Error>() {
            Some(err) => {
                eprint!("{}", err.format_for_terminal());
                std::process::exit(err.exit_code());
            }
            None => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            return handle_config_command(subcommand.clone(), cli.config.as_deref());
        }
        _ => {}
    }

    let config = PeerConfig::load(cli.config.as_deref())?;

    // Held for the lifetime of the program so file logs are flushed
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    debug!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting OpenMind peer"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("openmind-peer")
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Signal { bind, ttl } => run_signal(config, bind, ttl).await,
            Commands::Peers { url, json } => run_peers(config, url, json).await,
            Commands::Serve { backend, name, url } => run_serve(config, backend, name, url).await,
            Commands::Ask {
                prompt,
                peer,
                model,
                context,
                timeout,
                url,
            } => {
                let request = AskRequest {
                    prompt: prompt.join(" "),
                    peer,
                    model,
                    context,
                    timeout,
                };
                run_ask(config, request, url).await
            }
            Commands::Version | Commands::Config { .. } => Ok(()),
        }
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

// ─────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────

fn rendezvous_client(config: &PeerConfig, url: Option<String>) -> anyhow::Result<SharedRendezvous> {
    let url = url.unwrap_or_else(|| config.signaling.url.clone());
    let client = RendezvousClient::new(&url, Duration::from_millis(config.signaling.request_timeout_ms))?;
    Ok(Arc::new(client))
}

fn build_negotiator(config: &PeerConfig, peer_id: &str, rendezvous: SharedRendezvous) -> anyhow::Result<Arc<Negotiator>> {
    let transport = TcpTransportConfig::from_settings(peer_id, &config.transport)?;
    let negotiator = Negotiator::new(
        peer_id,
        rendezvous,
        Arc::new(TcpTransportFactory::new(transport)),
        NegotiatorConfig::from(&config.negotiation),
    )?;
    Ok(Arc::new(negotiator))
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

async fn run_signal(config: PeerConfig, bind: Option<String>, ttl: Option<u64>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| config.signaling.bind_addr.clone());
    let ttl = Duration::from_secs(ttl.unwrap_or(config.signaling.ttl_secs));
    if ttl.is_zero() {
        return Err(Error::config_field_invalid("signaling.ttl_secs", "must be greater than 0").into());
    }

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind signaling server to {}", bind))?;

    let store = Arc::new(RendezvousStore::new(ttl));
    let server = SignalServer::new(store, Duration::from_secs(config.signaling.purge_interval_secs));
    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

async fn run_peers(config: PeerConfig, url: Option<String>, json: bool) -> anyhow::Result<()> {
    let peer_id = identity::resolve(&config)?;
    let directory = PeerDirectory::new(rendezvous_client(&config, url)?);
    let peers = directory.discover(&peer_id).await;

    if json {
        println!("{}", serde_json::to_string(&peers)?);
    } else if peers.is_empty() {
        println!("No peers online.");
    } else {
        for peer in &peers {
            println!("{}", peer);
        }
    }
    Ok(())
}

async fn run_serve(
    config: PeerConfig,
    kind: BackendKind,
    name: Option<String>,
    url: Option<String>,
) -> anyhow::Result<()> {
    let peer_id = identity::resolve(&config)?;

    let backend: SharedBackend = match kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(OllamaConfig::from(&config.ollama))?),
        BackendKind::Mock => Arc::new(MockBackend::new()),
    };

    let negotiator = build_negotiator(&config, &peer_id, rendezvous_client(&config, url)?)?;
    let donor_config = DonorConfig::from_settings(&config.negotiation, name.or_else(|| config.peer.name.clone()));

    info!(peer_id = %peer_id, backend = backend.name(), "Serving");
    DonorService::new(negotiator, backend, donor_config)
        .run(shutdown_signal())
        .await?;
    Ok(())
}

struct AskRequest {
    prompt: String,
    peer: Option<String>,
    model: Option<String>,
    context: Option<String>,
    timeout: Option<u64>,
}

async fn run_ask(config: PeerConfig, request: AskRequest, url: Option<String>) -> anyhow::Result<()> {
    let context = match &request.context {
        Some(path) => {
            let path = shellexpand::tilde(path).into_owned();
            PromptContext::from_file(Path::new(&path))
                .with_context(|| format!("Failed to load context rows from {}", path))?
        }
        None => PromptContext::default(),
    };

    let peer_id = identity::resolve(&config)?;
    let rendezvous = rendezvous_client(&config, url)?;

    let target = match request.peer {
        Some(peer) => peer,
        None => PeerDirectory::new(rendezvous.clone())
            .discover(&peer_id)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No peers online. Start a donor with `openmind-peer serve`."))?,
    };

    let negotiator = build_negotiator(&config, &peer_id, rendezvous)?;
    let channel = negotiator.connect(&target).await?;
    let mux = StreamMultiplexer::new(channel);

    let model = request.model.unwrap_or_else(|| config.stream.default_model.clone());
    let timeout = match request.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.stream.request_timeout(),
    };

    let mut handle = mux.generate(&model, &context.apply(&request.prompt)).await?;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut stdout = std::io::stdout();

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, handle.next_token()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => handle.next_token().await,
        };
        match next {
            Some(token) => {
                print!("{}", token);
                stdout.flush()?;
            }
            None => break,
        }
    }

    let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
    let result = handle.wait_timeout(remaining).await;
    println!();
    mux.close();

    result?;
    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand, config_path: Option<&str>) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = PeerConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate => {
            PeerConfig::load(config_path)?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
