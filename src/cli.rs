//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the OpenMind peer.

use clap::{Parser, Subcommand, ValueEnum};

/// OpenMind Peer - peer-to-peer token streaming for local models
///
/// Runs the signaling server, lists peers, donates a local Ollama to the
/// network, or asks a donor to stream a completion back.
#[derive(Parser, Debug)]
#[command(name = "openmind-peer")]
#[command(
    author,
    version,
    about = "OpenMind Peer - peer-to-peer token streaming for local models",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, env = "OPENMIND_CONFIG", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Inference engine a donor serves from
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local Ollama daemon
    Ollama,
    /// Scripted echo backend, no model required
    Mock,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the rendezvous (signaling) server
    Signal {
        /// Address to listen on (overrides signaling.bind_addr)
        #[arg(short, long)]
        bind: Option<String>,

        /// Record lifetime in seconds (overrides signaling.ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// List peers currently registered with the rendezvous
    Peers {
        /// Rendezvous URL (overrides signaling.url)
        #[arg(long)]
        url: Option<String>,

        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Donate a local model: announce presence and answer requests
    Serve {
        /// Backend to generate with
        #[arg(short, long, value_enum, default_value_t = BackendKind::Ollama)]
        backend: BackendKind,

        /// Name advertised next to the peer id
        #[arg(short, long)]
        name: Option<String>,

        /// Rendezvous URL (overrides signaling.url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Ask a donor peer to stream a completion
    Ask {
        /// The prompt
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Donor to ask; the first discovered peer when omitted
        #[arg(short, long)]
        peer: Option<String>,

        /// Model to request (overrides stream.default_model)
        #[arg(short, long)]
        model: Option<String>,

        /// JSON file of context rows prepended to the prompt
        #[arg(long)]
        context: Option<String>,

        /// Seconds to wait for completion, 0 waits forever
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Rendezvous URL (overrides signaling.url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration file
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_about_names_the_tool() {
        let about = Cli::command().get_about().map(|a| a.to_string()).unwrap_or_default();
        assert!(about.starts_with("OpenMind Peer"));
    }

    #[test]
    fn test_signal_defaults() {
        let cli = Cli::parse_from(["openmind-peer", "signal"]);
        match cli.command {
            Commands::Signal { bind, ttl } => {
                assert!(bind.is_none());
                assert!(ttl.is_none());
            }
            _ => panic!("Expected Signal command"),
        }
    }

    #[test]
    fn test_signal_overrides() {
        let cli = Cli::parse_from(["openmind-peer", "signal", "--bind", "127.0.0.1:9000", "--ttl", "60"]);
        match cli.command {
            Commands::Signal { bind, ttl } => {
                assert_eq!(bind.as_deref(), Some("127.0.0.1:9000"));
                assert_eq!(ttl, Some(60));
            }
            _ => panic!("Expected Signal command"),
        }
    }

    #[test]
    fn test_serve_backend_choice() {
        let cli = Cli::parse_from(["openmind-peer", "serve"]);
        match cli.command {
            Commands::Serve { backend, .. } => assert_eq!(backend, BackendKind::Ollama),
            _ => panic!("Expected Serve command"),
        }

        let cli = Cli::parse_from(["openmind-peer", "serve", "--backend", "mock", "--name", "lab"]);
        match cli.command {
            Commands::Serve { backend, name, .. } => {
                assert_eq!(backend, BackendKind::Mock);
                assert_eq!(name.as_deref(), Some("lab"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_ask_collects_prompt_words() {
        let cli = Cli::parse_from([
            "openmind-peer",
            "ask",
            "--peer",
            "peer-abc12345",
            "what",
            "is",
            "week",
            "2?",
        ]);
        match cli.command {
            Commands::Ask { prompt, peer, model, timeout, .. } => {
                assert_eq!(prompt.join(" "), "what is week 2?");
                assert_eq!(peer.as_deref(), Some("peer-abc12345"));
                assert!(model.is_none());
                assert!(timeout.is_none());
            }
            _ => panic!("Expected Ask command"),
        }
    }

    #[test]
    fn test_ask_requires_prompt() {
        assert!(Cli::try_parse_from(["openmind-peer", "ask"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["openmind-peer", "-vv", "--config", "/tmp/p.toml", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
        assert_eq!(cli.config.as_deref(), Some("/tmp/p.toml"));
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["openmind-peer", "peers", "--config", "x.toml", "--json"]);
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(cli.command, Commands::Peers { json: true, .. }));
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["openmind-peer", "config", "init", "--force"]);
        match cli.command {
            Commands::Config { subcommand: ConfigSubcommand::Init { path, force } } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
