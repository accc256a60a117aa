//! certcache - command line front end
//!
//! Inspects and edits the configured certificate store, and can run a
//! minimal TLS listener that serves certificates straight from it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use certcache::{CertAcceptor, CertServingCache, Config};

/// certcache - per-hostname TLS certificates from a pluggable store
#[derive(Parser, Debug)]
#[command(name = "certcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTCACHE_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load, verify and describe the certificate for a hostname
    Check {
        hostname: String,
    },
    /// Write the raw bytes stored under a key to stdout
    Get {
        key: String,
    },
    /// Store the contents of a file (or stdin for "-") under a key
    Put {
        key: String,
        file: PathBuf,
    },
    /// Remove a key from the store
    Delete {
        key: String,
    },
    /// Accept TLS connections, resolving certificates by SNI
    Serve {
        #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:8443")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean for `get`
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let store = config.open_store().context("Failed to open certificate store")?;

    match cli.command {
        Commands::Check { hostname } => {
            let cache = CertServingCache::new(store, config.serving_cache_config()?)
                .context("Failed to build serving cache")?;
            let served = cache
                .get_certificate(&hostname)
                .await
                .with_context(|| format!("Certificate for {} is not servable", hostname))?;

            let leaf = served.leaf();
            println!("subject:    {}", leaf.subject);
            println!("issuer:     {}", leaf.issuer);
            println!("dns names:  {}", leaf.dns_names.join(", "));
            println!("not before: {}", leaf.not_before.to_rfc3339());
            println!("not after:  {}", leaf.not_after.to_rfc3339());
            println!("chain:      {} certificate(s)", served.chain().len());
        }
        Commands::Get { key } => {
            let data = store
                .get(&key)
                .await
                .with_context(|| format!("Failed to read {}", key))?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Commands::Put { key, file } => {
            let data = if file.as_os_str() == "-" {
                let mut buf = Vec::new();
                tokio::io::stdin().read_to_end(&mut buf).await?;
                buf
            } else {
                tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?
            };
            store
                .put(&key, &data)
                .await
                .with_context(|| format!("Failed to store {}", key))?;
            info!(key = %key, bytes = data.len(), "Stored key");
        }
        Commands::Delete { key } => {
            store
                .delete(&key)
                .await
                .with_context(|| format!("Failed to delete {}", key))?;
            info!(key = %key, "Deleted key");
        }
        Commands::Serve { listen } => {
            let cache = Arc::new(
                CertServingCache::new(store, config.serving_cache_config()?)
                    .context("Failed to build serving cache")?,
            );
            serve(CertAcceptor::new(cache), &listen).await?;
        }
    }

    Ok(())
}

async fn serve(acceptor: CertAcceptor, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(address = %listen, "Listening for TLS connections");

    let acceptor = Arc::new(acceptor);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let acceptor = Arc::clone(&acceptor);
                tokio::spawn(async move {
                    let mut tls = match acceptor.accept(tcp).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let server_name = tls.get_ref().1.server_name().unwrap_or_default().to_string();
                    debug!(peer = %peer, server_name = %server_name, "TLS handshake completed");

                    let greeting = format!("hello from {}\n", server_name);
                    if let Err(e) = tls.write_all(greeting.as_bytes()).await {
                        debug!(peer = %peer, error = %e, "Failed to write greeting");
                    }
                    let _ = tls.shutdown().await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                let stats = acceptor.cache().stats();
                info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    fetch_errors = stats.fetch_errors,
                    validation_errors = stats.validation_errors,
                    refreshes = stats.refreshes,
                    "Serving cache statistics"
                );
                return Ok(());
            }
        }
    }
}
