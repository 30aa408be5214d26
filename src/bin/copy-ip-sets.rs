use clap::{Parser, Subcommand};
use alb_waf_ops::cli::{
    init_logging, run_copy_all_ip_sets, run_copy_ip_set, CopyAllIpSetsArgs, CopyIpSetArgs,
};

/// Copies WAFv2 IP sets across regions. Sets are matched by name; an
/// existing destination set has its address list replaced.
#[derive(Parser, Debug)]
#[command(version, about = "copy WAFv2 IP sets across regions", long_about = None)]
struct Args {
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// copy a single set, optionally under a new name
    One(CopyIpSetArgs),
    /// copy every set of the source scope
    All(CopyAllIpSetsArgs),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let result = match args.command {
        Command::One(args) => run_copy_ip_set(args).await,
        Command::All(args) => run_copy_all_ip_sets(args).await,
    };

    if let Err(e) = result {
        log::error!("error: {:#}", e);
        std::process::exit(1);
    }
}
