#![forbid(unsafe_code)]
//! VaultChain node command line

use clap::{Parser, Subcommand};
use colored::*;
use rust_decimal::Decimal;
use std::time::Instant;
use vaultchain::accounts::IdentityDirectory;
use vaultchain::blockchain::Block;
use vaultchain::config::{load_config_from, Algorithm, Config, DEFAULT_CONFIG_PATH};
use vaultchain::node::{BlockRequest, ChainService};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstraps the chain (genesis or load) and prints the head
    Init,
    /// Seals a payload from a fresh identity A to a fresh identity B, mines it and opens it as B
    Demo {
        /// JSON payload to transfer
        #[arg(long, default_value = r#"{"amount":10}"#)]
        payload: String,
    },
    /// Prints every block of the chain
    Show,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = load_config_from(&cli.config)?;

    match &cli.command {
        Commands::Init => init(config).await?,
        Commands::Demo { payload } => demo(config, payload).await?,
        Commands::Show => show(config).await?,
    }

    Ok(())
}

fn short(value: &str) -> String {
    if value.len() > 20 {
        format!("{}...{}", &value[..10], &value[value.len() - 8..])
    } else {
        value.to_string()
    }
}

fn print_block(block: &Block) {
    println!(
        "{} {}  prev {}  txs {}  nonce {}  validator {}",
        format!("#{:<4}", block.index).bright_cyan().bold(),
        short(&block.hash).bright_yellow(),
        short(&block.previous_hash).dimmed(),
        block.transactions.len(),
        block.nonce,
        short(&block.validator).bright_magenta(),
    );
}

async fn init(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let path = config.database.path.clone();
    let service = ChainService::init(config)?;
    let head = service.head().await;

    println!("{}", "Chain ready".bright_green().bold());
    println!("  database: {}", path);
    println!("  length:   {}", service.len().await);
    print_block(&head);
    Ok(())
}

async fn demo(config: Config, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let service = ChainService::init(config)?;
    let directory = service.directory().clone();

    let alice = service.create_account("alice", "alice@example.com")?;
    let bob = service.create_account("bob", "bob@example.com")?;
    directory.credit(alice.fingerprint(), service.gas().gas_currency(), Decimal::ONE)?;
    if service.config().consensus.algorithm == Algorithm::Pos {
        let consensus = &service.config().consensus;
        directory.credit(alice.fingerprint(), &consensus.staking_currency, consensus.min_stake)?;
    }

    println!("{} {}", "A:".bold(), short(&alice.export_public_key()).bright_magenta());
    println!("{} {}", "B:".bold(), short(&bob.export_public_key()).bright_magenta());

    let started = Instant::now();
    let request = BlockRequest::Transfer {
        payload: payload.clone(),
        recipient: bob.export_public_key(),
    };
    let block = service
        .submit_metered(&alice.export_public_key(), request, 21_000, Decimal::ZERO)
        .await?;
    let elapsed = humantime::format_duration(started.elapsed());

    println!("{} in {}", "Block mined".bright_green().bold(), elapsed);
    print_block(&block);
    println!(
        "  gas left for A: {}",
        directory.balance(alice.fingerprint(), service.gas().gas_currency())?
    );

    let index = block.index as usize;
    let as_bob = service.get_decrypted_block_data(index, bob.secret_key()).await?;
    for entry in &as_bob {
        match entry {
            Ok(value) => println!("{} {}", "B reads:".bright_green(), value),
            Err(e) => println!("{} {}", "B fails:".red(), e),
        }
    }

    let as_alice = service.get_decrypted_block_data(index, alice.secret_key()).await?;
    for entry in &as_alice {
        if let Err(e) = entry {
            println!("{} {}", "A cannot read it:".yellow(), e);
        }
    }

    if as_bob.first().and_then(|r| r.as_ref().ok()) != Some(&payload) {
        return Err("recipient could not recover the payload".into());
    }
    Ok(())
}

async fn show(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let service = ChainService::init(config)?;
    let blocks = service.snapshot().await;
    println!("{} ({} blocks)", "VaultChain".bright_cyan().bold(), blocks.len());
    for block in &blocks {
        print_block(block);
    }
    Ok(())
}
