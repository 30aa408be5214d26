use std::env;

use anyhow::Context;
use clap::Args;

use crate::config;
use crate::index::ElasticsearchIndex;
use crate::ingest::{self, HighWaterMarkPolicy, IngestRequest};
use crate::replicate::{self, Endpoint};
use crate::store;
use crate::utils::Partition;
use crate::waf::{Scope, Wafv2Service};

/// Sets `RUST_LOG` from the `-d` count unless it is already set, then starts
/// the logger.
pub fn init_logging(debug: u8) {
    if env::var_os("RUST_LOG").is_none() {
        match debug {
            0 => env::set_var("RUST_LOG", "warn"),
            1 => env::set_var("RUST_LOG", "info"),
            2 => env::set_var("RUST_LOG", "debug"),
            _ => env::set_var("RUST_LOG", "trace"),
        }
    }
    env_logger::init();
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// bucket holding the ALB logs, e.g. s3://my-alb-logs (gs://, file:// and
    /// plain paths work too)
    #[arg(short = 'b', long = "bucket")]
    pub store_url: String,

    /// prefix below the bucket up to the year directory, e.g.
    /// AWSLogs/123456789012/elasticloadbalancing/us-east-1/
    #[arg(short = 'p', long)]
    pub base_prefix: String,

    /// month to ingest as YYYY/MM, defaults to the current month (UTC)
    #[arg(short, long)]
    pub month: Option<Partition>,

    /// search index URL, e.g. https://localhost:9200
    #[arg(long)]
    pub es_host: String,

    /// index the logs are written to
    #[arg(long)]
    pub es_index: String,

    /// index user, falls back to ES_USER
    #[arg(long)]
    pub es_user: Option<String>,

    /// index password, falls back to ES_PASS
    #[arg(long)]
    pub es_pass: Option<String>,

    /// what to do when the last indexed timestamp cannot be read
    #[arg(long, value_enum, default_value_t = HighWaterMarkPolicy::FallBack)]
    pub on_query_failure: HighWaterMarkPolicy,
}

pub async fn run_ingest(args: IngestArgs) -> Result<(), anyhow::Error> {
    let store = store::new(&args.store_url)?;
    let credentials = config::index_credentials(args.es_user, args.es_pass)?;
    let index = ElasticsearchIndex::new(&args.es_host, credentials)
        .with_context(|| format!("index client for {}", args.es_host))?;
    let partition = args.month.unwrap_or_else(Partition::current);

    let request = IngestRequest {
        base_prefix: &args.base_prefix,
        index: &args.es_index,
        partition,
        policy: args.on_query_failure,
    };
    let report = ingest::ingest(&store, &index, &request).await?;

    println!(
        "Indexed {} logs to index {} ({} objects, {} lines, {} already indexed, {} malformed)",
        report.written, args.es_index, report.objects, report.lines, report.stale, report.malformed
    );
    if report.high_water_mark_fallback {
        println!("warning: last indexed time unavailable, partition {} was indexed unfiltered", partition);
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct CopyIpSetArgs {
    /// source region
    #[arg(long = "sr")]
    pub source_region: String,

    /// destination region
    #[arg(long = "dr")]
    pub destination_region: String,

    /// source IP set name
    #[arg(long = "sn")]
    pub source_name: String,

    /// destination IP set name
    #[arg(long = "dn")]
    pub destination_name: String,

    /// source scope
    #[arg(long = "ss", value_enum, ignore_case = true)]
    pub source_scope: Scope,

    /// destination scope
    #[arg(long = "ds", value_enum, ignore_case = true)]
    pub destination_scope: Scope,
}

pub async fn run_copy_ip_set(args: CopyIpSetArgs) -> Result<(), anyhow::Error> {
    let source = Wafv2Service::connect(&args.source_region).await;
    let destination = Wafv2Service::connect(&args.destination_region).await;

    let outcome = replicate::replicate(
        Endpoint::new(&source, args.source_scope),
        &args.source_name,
        Endpoint::new(&destination, args.destination_scope),
        &args.destination_name,
    )
    .await
    .with_context(|| format!("copying IP set '{}'", args.source_name))?;

    println!(
        "IP set '{}' copied from {} to {} as '{}' ({:?})",
        args.source_name, args.source_region, args.destination_region, args.destination_name, outcome
    );
    Ok(())
}

#[derive(Args, Debug)]
pub struct CopyAllIpSetsArgs {
    /// source region
    #[arg(long = "sr")]
    pub source_region: String,

    /// destination region
    #[arg(long = "dr")]
    pub destination_region: String,

    /// source scope
    #[arg(long = "ss", value_enum, ignore_case = true)]
    pub source_scope: Scope,

    /// destination scope
    #[arg(long = "ds", value_enum, ignore_case = true)]
    pub destination_scope: Scope,
}

pub async fn run_copy_all_ip_sets(args: CopyAllIpSetsArgs) -> Result<(), anyhow::Error> {
    let source = Wafv2Service::connect(&args.source_region).await;
    let destination = Wafv2Service::connect(&args.destination_region).await;

    let summary = replicate::replicate_all(
        Endpoint::new(&source, args.source_scope),
        Endpoint::new(&destination, args.destination_scope),
    )
    .await
    .with_context(|| format!("listing IP sets in {}", args.source_region))?;

    for (name, result) in &summary.results {
        match result {
            Ok(outcome) => println!("{}: {:?} in {}", name, outcome, args.destination_region),
            Err(e) => println!("{}: failed: {}", name, e),
        }
    }

    let failed = summary.failures().count();
    if failed > 0 {
        anyhow::bail!("{} of {} IP sets were not copied", failed, summary.results.len());
    }
    Ok(())
}
