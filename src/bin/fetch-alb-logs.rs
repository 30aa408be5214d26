use clap::Parser;
use alb_waf_ops::cli::{init_logging, run_ingest, IngestArgs};

/// This program is intended for fetching one month of
/// ALB access logs from a bucket and indexing them. Lines at or before
/// the newest indexed timestamp are skipped, so it can run on a schedule.
#[derive(Parser, Debug)]
#[command(version, about = "fetch ALB logs from a bucket into a search index", long_about = None)]
struct Args {
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(flatten)]
    ingest: IngestArgs,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run_ingest(args.ingest).await {
        log::error!("error: {:#}", e);
        std::process::exit(1);
    }
}
