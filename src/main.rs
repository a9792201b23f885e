use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use edge_scan_rs::config::{ScanConfiguration, ScanParameters};
use edge_scan_rs::orchestrator::{Orchestrator, ScanPhase};
use edge_scan_rs::ranking;
use edge_scan_rs::server;
use edge_scan_rs::types::ResultSnapshot;

/// edge-scan-rs — CDN edge IP scanner with tunnel-proxied speed testing and a tiny embedded web UI.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "CDN edge IP scanner with tunnel-proxied speed testing and a tiny embedded web UI.",
    long_about = None
)]
struct Cli {
    /// Path to the scanner configuration file (JSON).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Named parameter preset: quick or standard.
    #[arg(long, default_value = "standard")]
    preset: String,

    /// Override: number of reachable IPs to speed test.
    #[arg(long)]
    target_count: Option<usize>,

    /// Override: TCP probe timeout in seconds.
    #[arg(long)]
    tcp_timeout_secs: Option<u64>,

    /// Override: tunnel connect timeout in seconds.
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Override: download window per candidate in seconds.
    #[arg(long)]
    speed_test_secs: Option<u64>,

    /// Max concurrent TCP probe attempts.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run the single-IP diagnostic test against this address and exit.
    #[arg(long)]
    test_ip: Option<IpAddr>,

    /// Write the result snapshot as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Start the embedded HTTP UI server instead of a one-shot scan.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Bind address for the UI server.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = ScanConfiguration::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut params = ScanParameters::preset(&cli.preset)
        .with_context(|| format!("unknown preset: {}", cli.preset))?;
    if let Some(v) = cli.target_count {
        params.target_ip_count = v;
    }
    if let Some(v) = cli.tcp_timeout_secs {
        params.tcp_timeout_secs = v;
    }
    if let Some(v) = cli.connect_timeout_secs {
        params.connect_timeout_secs = v;
    }
    if let Some(v) = cli.speed_test_secs {
        params.speed_test_secs = v;
    }
    if let Some(v) = cli.concurrency {
        params.probe_concurrency = v;
    }
    params.validate()?;

    let uuid_prefix: String = config.uuid.chars().take(8).collect();
    println!("edge-scan-rs configuration:");
    println!("  server       : {}", config.server_name);
    println!("  uuid         : {uuid_prefix}...");
    println!("  vless port   : {}", config.vless_port);
    println!("  socks port   : {}", config.local_socks_port);
    println!("  providers    : {}", config.providers.len());
    println!("  ranges       : {}", config.ranges.len());
    println!("  preset       : {}", cli.preset);

    let orchestrator = Arc::new(Orchestrator::new(config));

    if cli.serve_ui {
        println!("UI server starting at http://{} (Ctrl+C to stop)", cli.bind);
        let orch = orchestrator.clone();
        let bind = cli.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, orch).await {
                eprintln!("HTTP UI server error: {e}");
            }
        });
        let _ = tokio::signal::ctrl_c().await;
        return Ok(());
    }

    if let Some(ip) = cli.test_ip {
        println!("\nTesting single IP {ip} through the tunnel...");
        let result = orchestrator.single_ip_test(ip, params).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let (session, handle) = orchestrator.start_scan(params).await?;

    // Ctrl-C cancels the scan; the pipeline tears its resources down.
    let cancel = session.cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    handle.await?;

    let status = session.status().await;
    match status.state {
        ScanPhase::Failed => {
            bail!(
                "scan failed: {}",
                status.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        ScanPhase::Cancelled => {
            println!("\nScan cancelled.");
            return Ok(());
        }
        _ => {}
    }

    let results = session.results().await;
    let snapshot = ranking::snapshot(&results);
    print_ranked_table(&snapshot);

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_snapshot_json(path, &snapshot) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    Ok(())
}

fn print_ranked_table(snapshot: &ResultSnapshot) {
    if snapshot.ranked.is_empty() {
        println!(
            "\nCompleted: no working candidates ({} tested).",
            snapshot.raw.len()
        );
        return;
    }

    let mut ip_w = "ip".len();
    let mut op_w = "operator".len();
    for e in &snapshot.ranked {
        ip_w = ip_w.max(e.ip.to_string().len());
        op_w = op_w.max(e.operator.len());
    }

    println!(
        "\nWorking candidates: {} (tested: {})",
        snapshot.ranked.len(),
        snapshot.raw.len()
    );
    println!(
        "{:<4}  {:<ip_w$}  {:>10}  {:>10}  {:<op_w$}",
        "rank",
        "ip",
        "MB/s",
        "latency_ms",
        "operator",
        ip_w = ip_w,
        op_w = op_w
    );
    println!(
        "{:-<4}  {:-<ip_w$}  {:-<10}  {:-<10}  {:-<op_w$}",
        "",
        "",
        "",
        "",
        "",
        ip_w = ip_w,
        op_w = op_w
    );
    for e in &snapshot.ranked {
        println!(
            "{:<4}  {:<ip_w$}  {:>10.2}  {:>10}  {:<op_w$}",
            e.rank,
            e.ip.to_string(),
            e.speed_mbps,
            e.latency_ms,
            e.operator,
            ip_w = ip_w,
            op_w = op_w
        );
    }

    let best = &snapshot.ranked[0];
    println!("\nBest IP: {} ({:.2} MB/s)", best.ip, best.speed_mbps);
}

fn write_snapshot_json(path: &std::path::Path, snapshot: &ResultSnapshot) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, snapshot)?;
    Ok(())
}
