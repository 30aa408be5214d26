use clap::{Parser, Subcommand};

use alb_waf_ops::cli::{
    init_logging, run_copy_all_ip_sets, run_copy_ip_set, run_ingest, CopyAllIpSetsArgs,
    CopyIpSetArgs, IngestArgs,
};

#[derive(Parser)]
#[command(version, about = "ALB log ingestion and WAF IP set replication", long_about = None)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase debug level (use -d for info, -dd for debug, etc.)")]
    debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index one month of ALB access logs, skipping what is already indexed.
    Ingest(IngestArgs),
    /// Copy one WAF IP set to another region or scope.
    CopyIpSet(CopyIpSetArgs),
    /// Copy every WAF IP set of a scope to another region or scope.
    CopyAllIpSets(CopyAllIpSetsArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Commands::Ingest(args) => run_ingest(args).await,
        Commands::CopyIpSet(args) => run_copy_ip_set(args).await,
        Commands::CopyAllIpSets(args) => run_copy_all_ip_sets(args).await,
    };

    if let Err(e) = result {
        log::error!("error: {:#}", e);
        std::process::exit(1);
    }
}
