// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strand hub server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand_server::{build_service, AllowAll, ServiceConfig};

/// Strand storage hub.
#[derive(Debug, Parser)]
#[command(name = "strand-server", version)]
struct Args {
    /// TCP port to listen on. Falls back to the PORT environment
    /// variable, then 7420.
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding per-space databases. Falls back to SPACES_DIR,
    /// then ./spaces.
    #[arg(long)]
    spaces_dir: Option<PathBuf>,
    /// Apply writes by codec merge when base heads mismatch, instead of
    /// conflicting. Falls back to ENABLE_SERVER_MERGE.
    #[arg(long)]
    enable_server_merge: bool,
    /// Transaction deadline in seconds.
    #[arg(long, default_value_t = 30)]
    tx_deadline_secs: u64,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(7420);
    let spaces_dir = args
        .spaces_dir
        .or_else(|| std::env::var("SPACES_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./spaces"));
    let server_merge = args.enable_server_merge || env_flag("ENABLE_SERVER_MERGE");

    let service = build_service(
        &spaces_dir,
        Arc::new(AllowAll),
        server_merge,
        ServiceConfig {
            op_deadline: Duration::from_secs(args.tx_deadline_secs),
            ..ServiceConfig::default()
        },
    );

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    info!(port, spaces = %spaces_dir.display(), server_merge, "strand hub listening");

    tokio::select! {
        () = service.serve(listener) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("install ctrl-c handler")?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}
