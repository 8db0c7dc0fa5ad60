use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use eth_bid_collect::{bids::SourceType, log, Collector, CollectorConfig};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write bid files into, overrides BIDS_OUT_DIR.
    #[clap(long)]
    out_dir: Option<PathBuf>,
    /// Write tab separated files instead of comma separated ones.
    #[clap(long)]
    tsv: bool,
    /// Comma separated sources to collect from, e.g. data-api,ultrasound-stream.
    #[clap(long, value_delimiter = ',')]
    sources: Option<Vec<SourceType>>,
    /// Instance id added to file names, lets collectors share an output directory.
    #[clap(long)]
    uid: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    log::init();

    let cli = Cli::parse();

    let mut config = CollectorConfig::from_env()?;
    if let Some(out_dir) = cli.out_dir {
        config.out_dir = out_dir;
    }
    if cli.tsv {
        config.output_tsv = true;
    }
    if let Some(sources) = cli.sources {
        config.sources = sources;
    }
    if let Some(uid) = cli.uid {
        config.uid = Some(uid);
    }

    let collector = Collector::new(config)?;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c, shutting down"),
            Err(err) => error!(?err, "failed to listen for ctrl-c, shutting down"),
        }
        cancel_on_signal.cancel();
    });

    collector.run(cancel).await
}
