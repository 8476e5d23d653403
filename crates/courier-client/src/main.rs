//! `courier` -- encrypted direct messages from the command line.
//!
//! Output is JSON on stdout, one value per line; logs go to stderr.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use courier_client::logging::init_tracing;
use courier_client::{ClientConfig, ClientContext};
use courier_shared::{Identity, PublicKey, Signer};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Encrypted direct messages over relays", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay to use instead of the configured list (repeatable)
    #[arg(short, long = "relay", global = true)]
    relays: Vec<String>,

    /// Hex secret key; overrides COURIER_SECRET_KEY
    #[arg(long, global = true)]
    secret_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and print its keys
    Keygen,

    /// Connect to the relays and print their status
    Relays,

    /// Send a message
    Send {
        /// Recipient public key (hex)
        pubkey: String,
        /// Message text
        text: String,
    },

    /// Print the conversation with a counterparty
    Fetch {
        /// Counterparty public key (hex)
        pubkey: String,
    },

    /// List counterparties of the local identity
    Conversations,

    /// Print incoming messages until interrupted
    Listen,

    /// Delete every cached message
    ClearCache,
}

#[derive(Serialize)]
struct KeyPair {
    public_key: PublicKey,
    secret_key: String,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Commands::Keygen = cli.command {
        let identity = Identity::generate();
        return print_json(&KeyPair {
            public_key: identity.public_key(),
            secret_key: identity.secret_hex(),
        });
    }

    let mut config = ClientConfig::from_env();
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }
    if cli.secret_key.is_some() {
        config.secret_key = cli.secret_key.clone();
    }

    let context = ClientContext::open(config).context("failed to open client")?;
    context.start().await;

    let result = run(&context, cli.command).await;
    context.shutdown().await;
    result
}

async fn run(context: &ClientContext, command: Commands) -> Result<()> {
    let manager = &context.network.manager;
    if !manager.wait_for_connection(context.config.connect_timeout).await {
        warn!("No relay connected yet");
    }

    if let Commands::Relays = command {
        for relay in manager.list_relays().await {
            print_json(&relay)?;
        }
        return Ok(());
    }

    if let Commands::ClearCache = command {
        context.engine.clear_cache()?;
        return Ok(());
    }

    let Some(identity) = context.configured_identity()? else {
        bail!("no identity: pass --secret-key or set COURIER_SECRET_KEY");
    };
    let engine = &context.engine;
    engine.login(Arc::new(identity)).await;

    match command {
        Commands::Send { pubkey, text } => {
            let recipient: PublicKey = pubkey.parse().context("invalid recipient")?;
            let message = engine.send(&recipient, &text).await?;
            print_json(&message)?;
        }

        Commands::Fetch { pubkey } => {
            let counterparty: PublicKey = pubkey.parse().context("invalid counterparty")?;
            for message in engine.fetch(&counterparty).await? {
                print_json(&message)?;
            }
        }

        Commands::Conversations => {
            for counterparty in engine.list_conversations().await? {
                print_json(&counterparty)?;
            }
        }

        Commands::Listen => {
            let live = engine
                .subscribe_live(|message| {
                    if let Ok(line) = serde_json::to_string(&message) {
                        println!("{line}");
                    }
                })
                .await?;
            info!("Listening, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            live.stop().await;
        }

        Commands::Keygen | Commands::Relays | Commands::ClearCache => {}
    }

    Ok(())
}
