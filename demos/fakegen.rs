/*!
Generate random-walk ticks for the file provider, so the service can be tried without an API key
*/
use clap::Parser;
use std::path::PathBuf;
use stockcast::data::fake::random_walk_ticks;
use stockcast::data::file::FileProvider;
use stockcast::data::{Interval, Tick};

#[derive(Debug, Parser)]
struct Args {
    /// Symbols to generate
    #[arg(required = true)]
    symbols: Vec<String>,
    /// Ticks per symbol
    #[arg(short, long, default_value_t = 2000)]
    points: usize,
    /// Output directory
    #[arg(short, long, default_value = "data")]
    out: PathBuf,
    /// Seed of the first symbol; later symbols count up from it
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let files = FileProvider::new(&args.out);
    for (i, symbol) in args.symbols.iter().enumerate() {
        let symbol = symbol.trim().to_uppercase();
        let ticks: Vec<Tick> = random_walk_ticks(args.seed + i as u64)
            .take(args.points)
            .collect();
        let written = files.store(&symbol, Interval::Min5, &ticks)?;
        println!(
            "{}: {} ticks -> {}",
            symbol,
            written,
            files.path_for(&symbol, Interval::Min5).display()
        );
    }
    Ok(())
}
