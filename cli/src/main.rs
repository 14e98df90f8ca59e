//! Minimal demonstration binary wired on top of the chronology engine
//! library crates. Exercises `open`, `replay`, and `stats` end to end for
//! manual testing; not a claim of feature completeness against the
//! reference tool's `<db-path> <txid> [blocks=N-M]` surface.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use chronoq_core::errors::ChronoqError;
use chronoq_core::hash::TxHash;
use chronoq_core::Config;
use chronoq_cq::store::Db;
use chronoq_mff::{Block, Delegate, Reason, Replayer, SerializationContext, TxObject};

#[derive(Parser)]
#[command(name = "chronoq", version, about = "Inspect a mempool chronology log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open (creating if necessary) a database directory and report its
    /// registry state.
    Open { db_path: PathBuf },

    /// Replay events from a segment onward, printing one line per event.
    Replay {
        db_path: PathBuf,
        #[arg(long)]
        from: Option<u64>,
    },

    /// Print registry tip, cluster count, and dictionary size.
    Stats { db_path: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        }
    };

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(command: Command) -> Result<(), ChronoqError> {
    match command {
        Command::Open { db_path } => cmd_open(&db_path),
        Command::Replay { db_path, from } => cmd_replay(&db_path, from),
        Command::Stats { db_path } => cmd_stats(&db_path),
    }
}

fn cmd_open(db_path: &PathBuf) -> Result<(), ChronoqError> {
    let config = Config::default();
    let db = Db::open_or_create(db_path, "chronoq", &config)?;
    println!("opened {}", db_path.display());
    println!("registry tip: {}", db.registry.tip);
    println!("cluster count: {}", db.registry.clusters.ids.len());
    Ok(())
}

fn cmd_stats(db_path: &PathBuf) -> Result<(), ChronoqError> {
    let config = Config::default();
    let db = Db::open_or_create(db_path, "chronoq", &config)?;
    let registry_tip = db.registry.tip;
    let cluster_count = db.registry.clusters.ids.len();

    let mut ctx = SerializationContext::new(db, config);
    if ctx.db.goto_segment(0).is_ok() {
        let mut replayer = Replayer::new(ctx);
        replayer.fast_forward()?;
        ctx = replayer.into_context();
    }

    println!("registry tip: {registry_tip}");
    println!("cluster count: {cluster_count}");
    println!("dictionary size: {}", ctx.dictionary_len());
    println!("chain tip: {:?}", ctx.chain.tip());
    Ok(())
}

fn cmd_replay(db_path: &PathBuf, from: Option<u64>) -> Result<(), ChronoqError> {
    let config = Config::default();
    let db = Db::open_or_create(db_path, "chronoq", &config)?;
    let mut ctx = SerializationContext::new(db, config);
    ctx.db.goto_segment(from.unwrap_or(0))?;

    let mut replayer = Replayer::new(ctx);
    let mut delegate = LoggingDelegate::default();
    replayer.run(&mut delegate)?;
    println!("{} events replayed", delegate.count);
    Ok(())
}

/// Prints a one-line summary per replayed event, per the demonstration
/// tool's `replay` contract.
#[derive(Default)]
struct LoggingDelegate {
    count: u64,
}

impl Delegate for LoggingDelegate {
    fn receive_transaction(&mut self, object: &TxObject) {
        self.count += 1;
        println!("mempool-in  {} fee={} weight={}", object.hash, object.fee, object.weight);
    }

    fn receive_transaction_by_hash(&mut self, hash: &TxHash) {
        self.count += 1;
        println!("mempool-in  {hash} (known)");
    }

    fn forget_transaction(&mut self, hash: &TxHash, reason: Reason) {
        self.count += 1;
        println!("mempool-out {hash} reason={reason:?}");
    }

    fn discard_transaction(&mut self, hash: &TxHash, raw: &[u8], reason: Reason, cause: Option<TxHash>) {
        self.count += 1;
        match cause {
            Some(cause) => println!(
                "invalidated {hash} reason={reason:?} cause={cause} raw_len={}",
                raw.len()
            ),
            None => println!("invalidated {hash} reason={reason:?} raw_len={}", raw.len()),
        }
    }

    fn block_confirmed(&mut self, block: &Block) {
        self.count += 1;
        println!(
            "block-mined height={} hash={} known={} unknown={}",
            block.height,
            block.hash,
            block.known.len(),
            block.unknown.len()
        );
    }

    fn block_reorged(&mut self, height: u32) {
        self.count += 1;
        println!("block-unmined height={height}");
    }

    fn iterated(&mut self, from_offset: u64, to_offset: u64) {
        tracing::debug!(from = from_offset, to = to_offset, "advanced");
    }
}
