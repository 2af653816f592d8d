//! Command-line tools for the HyperSim security subsystem.
//!
//! ```text
//! hypersim-security keygen
//! hypersim-security sign '{"action":"quote"}'
//! hypersim-security verify '<signed envelope json>'
//! hypersim-security storage list | rotate
//! hypersim-security audit query --min-severity high --limit 20
//! hypersim-security config check security.toml
//! ```
//!
//! Commands that open the encrypted store read the master secret from the
//! environment variable named by `--master-secret-env`.

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hypersim_security::audit::auditor::{query_directory, summarize};
use hypersim_security::audit::{AuditQuery, SecurityEventType, Severity};
use hypersim_security::config::{load_config, SecurityConfig};
use hypersim_security::observability::logging::init_tracing;
use hypersim_security::signing::{RequestSigner, SignedEnvelope};
use hypersim_security::storage::{generate_master_secret, SecureStorage};

#[derive(Parser)]
#[command(name = "hypersim-security")]
#[command(about = "Key, signing, storage and audit tools for the HyperSim SDK", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment variable holding the storage master secret
    #[arg(long, default_value = "HYPERSIM_MASTER_SECRET")]
    master_secret_env: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh Ed25519 key pair
    Keygen,
    /// Sign a JSON payload with the stored request-signing key
    Sign { payload: String },
    /// Verify a signed request envelope
    Verify { envelope: String },
    /// Inspect or re-key the encrypted store
    Storage {
        #[command(subcommand)]
        action: StorageAction,
    },
    /// Read the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum StorageAction {
    /// List stored keys
    List,
    /// Re-encrypt every record under a new master secret
    Rotate {
        /// Environment variable holding the new secret; one is generated when omitted
        #[arg(long)]
        new_secret_env: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print matching events as JSON lines
    Query {
        /// Event type, e.g. failed_signature
        #[arg(long = "type")]
        event_type: Option<String>,
        /// low, medium, high or critical
        #[arg(long)]
        min_severity: Option<String>,
        /// Lower bound, milliseconds since the Unix epoch
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        /// Print aggregate counts instead of events
        #[arg(long)]
        stats: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate a configuration file
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("hypersim_security=warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            let key = SigningKey::generate(&mut OsRng);
            let output = json!({
                "algorithm": "Ed25519",
                "public_key": hex::encode(key.verifying_key().to_bytes()),
                "private_key": hex::encode(key.to_bytes()),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Sign { payload } => {
            let config = load(cli.config.as_deref())?;
            let data: Value = serde_json::from_str(&payload)?;
            let storage = open_storage(&config, &cli.master_secret_env).await?;
            let signer = RequestSigner::new(&config.signing, storage);
            signer.initialize().await?;
            let envelope = signer.sign_request(data).await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        Commands::Verify { envelope } => {
            let config = load(cli.config.as_deref())?;
            let envelope: SignedEnvelope = serde_json::from_str(&envelope)?;
            let storage = Arc::new(SecureStorage::in_memory(&config.storage));
            let signer = RequestSigner::new(&config.signing, storage);
            match signer.verify_request(&envelope).await {
                Ok(()) => println!("valid (public key {})", envelope.public_key),
                Err(e) => {
                    eprintln!("invalid: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Storage { action } => {
            let config = load(cli.config.as_deref())?;
            let storage = open_storage(&config, &cli.master_secret_env).await?;
            match action {
                StorageAction::List => {
                    let stats = storage.stats().await?;
                    for key in storage.list_keys().await? {
                        println!("{}", key);
                    }
                    eprintln!(
                        "{} key(s), {} bytes ({:?})",
                        stats.key_count,
                        stats.total_size.unwrap_or(0),
                        stats.storage_type
                    );
                }
                StorageAction::Rotate { new_secret_env } => {
                    let (secret, generated) = match new_secret_env {
                        Some(var) => (read_secret(&var)?, false),
                        None => (generate_master_secret(), true),
                    };
                    let printable = generated.then(|| secret.expose_secret().to_string());
                    let rotated = storage.rotate_key(Some(secret)).await?;
                    println!("re-encrypted {} record(s)", rotated);
                    if let Some(secret) = printable {
                        println!("new master secret: {}", secret);
                    }
                }
            }
        }
        Commands::Audit { action } => {
            let config = load(cli.config.as_deref())?;
            match action {
                AuditAction::Query {
                    event_type,
                    min_severity,
                    since,
                    limit,
                    stats,
                } => {
                    let filter = AuditQuery {
                        event_type: event_type.map(|t| parse_label::<SecurityEventType>(&t)).transpose()?,
                        min_severity: min_severity.map(|s| parse_label::<Severity>(&s)).transpose()?,
                        since,
                        until: None,
                        limit,
                    };
                    let events = query_directory(&config.audit.log_directory, &filter).await?;
                    if stats {
                        println!("{}", serde_json::to_string_pretty(&summarize(&events))?);
                    } else {
                        for event in events {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                    }
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Check { path } => match load_config(&path) {
                Ok(config) => {
                    println!("{}: ok", path.display());
                    println!(
                        "  signing={} multisig={} ddos_protection={} validation={:?} pins={}",
                        config.signing.enabled,
                        config.multisig.enabled,
                        config.rate_limit.ddos_protection,
                        config.validation.level,
                        config.websocket.certificate_pins.len()
                    );
                }
                Err(e) => {
                    eprintln!("{}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
        },
    }

    Ok(())
}

fn load(path: Option<&Path>) -> Result<SecurityConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(SecurityConfig::default()),
    }
}

fn read_secret(var: &str) -> Result<SecretString, Box<dyn std::error::Error>> {
    let value = std::env::var(var).map_err(|_| format!("environment variable {} is not set", var))?;
    Ok(SecretString::from(value))
}

async fn open_storage(
    config: &SecurityConfig,
    secret_env: &str,
) -> Result<Arc<SecureStorage>, Box<dyn std::error::Error>> {
    let secret = if config.storage.memory_only {
        None
    } else {
        Some(read_secret(secret_env)?)
    };
    Ok(Arc::new(SecureStorage::open(&config.storage, secret).await?))
}

/// Parse a snake_case label into one of the audit enums.
fn parse_label<T: serde::de::DeserializeOwned>(label: &str) -> Result<T, Box<dyn std::error::Error>> {
    serde_json::from_value(Value::String(label.to_string()))
        .map_err(|_| format!("unknown value '{}'", label).into())
}
