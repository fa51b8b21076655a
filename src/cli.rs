//! Command-line driver
//!
//! Reads JSON-lines flow records from a file or stdin, feeds them through an
//! engine backed by the in-memory store, and prints evidence as JSON lines
//! on stdout. A bare `stop` line acts as the shutdown sentinel; end of input
//! does the same.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use flowsentry::config::Config;
use flowsentry::engine::Engine;
use flowsentry::sink::ChannelSink;
use flowsentry::store::MemoryStore;
use flowsentry::types::FlowRecord;

#[derive(Parser)]
#[command(name = "flowsentry")]
#[command(about = "Behavioral analyzer for parsed network flow records")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON-lines flow input, '-' for stdin
    #[arg(short, long, default_value = "-")]
    pub input: String,

    /// Treat the input as a live capture (enables the DNS warm-up)
    #[arg(long)]
    pub live: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if cli.live {
        config.detection.live_capture = true;
    }

    let store = Arc::new(MemoryStore::new());
    store.set_start_time(Utc::now().timestamp() as f64);

    let (evidence_tx, mut evidence_rx) = mpsc::channel(1024);
    let (engine, tx) = Engine::new(&config, store.clone(), Arc::new(ChannelSink::new(evidence_tx)));

    let printer = tokio::spawn(async move {
        while let Some(evidence) = evidence_rx.recv().await {
            match serde_json::to_string(&evidence) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to serialize evidence: {e}"),
            }
        }
    });
    let engine_handle = tokio::spawn(engine.run());

    let reader: Box<dyn AsyncBufRead + Unpin> = if cli.input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(&cli.input)
            .await
            .with_context(|| format!("Failed to open input file: {}", cli.input))?;
        Box::new(BufReader::new(file))
    };

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "stop" {
            break;
        }
        match FlowRecord::from_json(line) {
            Ok(rec) => {
                // mirror what the upstream profiler would have written
                store.record(&rec);
                if tx.send(rec).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Skipping malformed record: {e}"),
        }
    }
    let _ = tx.stop().await;
    drop(tx);

    let stats = engine_handle.await.context("engine task panicked")??;
    printer.await.ok();

    info!(
        "Processed {} events, emitted {} evidence records ({} suppressed)",
        stats.events, stats.evidence_emitted, stats.evidence_suppressed
    );
    Ok(())
}
