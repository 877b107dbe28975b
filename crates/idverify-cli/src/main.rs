use clap::{Parser, Subcommand};
use idverify_adapters::{InMemoryLedger, InMemoryWallet};
use idverify_core::reconciler::ReconcileUpdate;
use idverify_core::{
    derive_fingerprint, Address, ClientConfig, IdentityClient, IdentityFingerprint,
    IdentityRecord, LedgerEventKind, Role, WalletProvider,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEMO_USER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

#[derive(Debug, Parser)]
#[command(name = "idverify", version, about = "Identity verification client")]
struct Cli {
    /// JSON configuration file; defaults apply when it does not exist.
    #[arg(long, env = "IDVERIFY_CONFIG", default_value = "idverify.json")]
    config: PathBuf,
    /// Override the identity registry contract address.
    #[arg(long, env = "IDVERIFY_CONTRACT_ADDRESS")]
    contract_address: Option<String>,
    /// Emit logs as JSON.
    #[arg(long, env = "IDVERIFY_LOG_JSON")]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Derive the identity fingerprint for a name and document hash.
    Fingerprint {
        #[arg(long)]
        name: String,
        #[arg(long)]
        document_hash: String,
    },
    /// Check a fingerprint on a fresh simulated ledger, optionally seeding its history.
    Status {
        fingerprint: String,
        /// Seed a registration event before checking.
        #[arg(long, default_value_t = false)]
        registered: bool,
        /// Seed a verification event before checking.
        #[arg(long, default_value_t = false)]
        verified: bool,
    },
    /// Run register, verify, and a rejected verification against the simulated ledger.
    Demo {
        #[arg(long, default_value = "Alice")]
        name: String,
        #[arg(long, default_value = "doc123")]
        document_hash: String,
    },
}

#[derive(Debug, Serialize)]
struct FingerprintOutput {
    fingerprint: String,
    short: String,
}

#[derive(Debug, Serialize)]
struct DemoOutput {
    contract: String,
    fingerprint: String,
    after_register: IdentityRecord,
    after_verify: IdentityRecord,
    rejected_verification: String,
    pending: usize,
    live_updates: usize,
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::load(&cli.config)?;
    if let Some(address) = &cli.contract_address {
        config.contract_address = Address::parse(address)?;
    }
    if cli.json {
        config.logging.json = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &ClientConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            format!("idverify={level},{level}", level = config.logging.level).into()
        });

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn client_for(
    ledger: &Arc<InMemoryLedger>,
    account: Address,
    config: &ClientConfig,
) -> IdentityClient {
    let wallet: Arc<dyn WalletProvider> = Arc::new(InMemoryWallet::with_account(account));
    IdentityClient::new(Some(wallet), ledger.clone(), config.clone())
}

async fn status(
    config: &ClientConfig,
    fingerprint: &str,
    registered: bool,
    verified: bool,
) -> anyhow::Result<IdentityRecord> {
    let fingerprint = IdentityFingerprint::parse(fingerprint)?;
    let ledger = Arc::new(InMemoryLedger::from_config(config));
    if registered {
        ledger.inject_event(LedgerEventKind::Registered, fingerprint);
    }
    if verified {
        ledger.inject_event(LedgerEventKind::Verified, fingerprint);
    }

    let client = client_for(&ledger, config.verifier_address.clone(), config);
    client.reconciler().load_history().await;
    Ok(client.status(&fingerprint))
}

async fn demo(
    config: &ClientConfig,
    name: &str,
    document_hash: &str,
) -> anyhow::Result<DemoOutput> {
    let ledger = Arc::new(InMemoryLedger::from_config(config));
    let user = client_for(&ledger, Address::parse(DEMO_USER)?, config);
    let verifier = client_for(&ledger, config.verifier_address.clone(), config);

    user.connect().await?;
    verifier.connect().await?;
    if !verifier.authorize(Role::Verifier).is_allowed() {
        anyhow::bail!(
            "configured verifier {} was not granted the verifier role",
            config.verifier_address
        );
    }

    let live_updates = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = live_updates.clone();
    let subscription = verifier
        .start_sync(Arc::new(move |update: &ReconcileUpdate| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            info!(
                fingerprint = %update.record.fingerprint.short(),
                status = ?update.record.status(),
                pending = update.pending.len(),
                "Status view updated"
            );
        }))
        .await;

    let registration = user.register(name, document_hash)?;
    let fingerprint = registration.fingerprint();
    registration.wait().await?;
    let after_register = verifier.check_status(&fingerprint).await?;

    verifier.verify(fingerprint).wait().await?;
    let after_verify = verifier.check_status(&fingerprint).await?;

    // A second verification is refused by the contract.
    let rejected_verification = match verifier.verify(fingerprint).wait().await {
        Ok(_) => anyhow::bail!("duplicate verification unexpectedly succeeded"),
        Err(e) => e.to_string(),
    };

    let pending = verifier.pending().len();
    subscription.unsubscribe();

    Ok(DemoOutput {
        contract: ledger.contract_address().to_string(),
        fingerprint: fingerprint.to_hex(),
        after_register,
        after_verify,
        rejected_verification,
        pending,
        live_updates: live_updates.load(std::sync::atomic::Ordering::SeqCst),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);
    info!(
        contract = %config.contract_address,
        config = %cli.config.display(),
        "Configuration loaded"
    );

    let output = match &cli.command {
        Command::Fingerprint {
            name,
            document_hash,
        } => {
            let fingerprint = derive_fingerprint(name, document_hash)?;
            serde_json::to_string_pretty(&FingerprintOutput {
                fingerprint: fingerprint.to_hex(),
                short: fingerprint.short(),
            })?
        }
        Command::Status {
            fingerprint,
            registered,
            verified,
        } => serde_json::to_string_pretty(
            &status(&config, fingerprint, *registered, *verified).await?,
        )?,
        Command::Demo {
            name,
            document_hash,
        } => serde_json::to_string_pretty(&demo(&config, name, document_hash).await?)?,
    };

    println!("{output}");
    Ok(())
}
