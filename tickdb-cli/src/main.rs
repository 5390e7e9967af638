//! TickDB CLI - interactive shell for the time-series storage engine

mod aggregate;
mod bench;
mod repl;

use repl::Repl;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));
    info!("Data directory: {:?}", data_dir);

    let mut repl = Repl::new(data_dir);
    repl.run()
}
