use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use shiplog_decode::{OfflineDecoder, Pattern, DEFAULT_PATTERN};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shiplog-decode")]
#[command(about = "Decode encrypted shiplog chunk files into text", long_about = None)]
struct Cli {
    /// Chunk file written by a durable sink.
    input: PathBuf,

    /// Receiver private key, hex encoded.
    private_key: String,

    /// Text file the decoded lines are appended to.
    output: PathBuf,

    /// Line pattern: %l %D %S %M %p %t %# %F %f %v.
    #[arg(long, default_value = DEFAULT_PATTERN)]
    pattern: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let decoder = OfflineDecoder::from_secret_hex(&cli.private_key)
        .context("Failed to load receiver private key")?
        .with_pattern(Pattern::compile(&cli.pattern));

    let stats = decoder
        .decode_file(&cli.input, &cli.output)
        .with_context(|| format!("Failed to decode {}", cli.input.display()))?;

    if stats.skipped_items > 0 || stats.abandoned_chunks > 0 {
        warn!(
            skipped_items = stats.skipped_items,
            abandoned_chunks = stats.abandoned_chunks,
            "some records could not be recovered"
        );
    }
    info!(output = %cli.output.display(), lines = stats.lines, "done");
    Ok(())
}
