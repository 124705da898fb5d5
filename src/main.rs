use anyhow::Context;
use clap::{Arg, ArgAction, Parser};
use s3_meta_sync::{
    sync_pair, S3Config, S3Store, SyncConfig, SyncError, SyncPair, SyncSummary, TransferExecutor,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "s3-meta-sync")]
#[command(about = "Sync a local directory with an S3 bucket:prefix", long_about = None)]
#[command(version, disable_version_flag = true)]
#[command(arg(Arg::new("version").long("version").action(ArgAction::Version).help("Print version")))]
struct Args {
    /// Source: a local directory or bucket:prefix
    source: String,

    /// Destination: a local directory or bucket:prefix
    destination: String,

    /// AWS access key
    #[arg(short, long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    key: Option<String>,

    /// AWS secret key
    #[arg(short, long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret: Option<String>,

    /// AWS region
    #[arg(short, long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Custom S3-compatible endpoint (path-style addressing)
    #[arg(long)]
    endpoint: Option<String>,

    /// Canned ACL for uploaded objects, e.g. public-read
    #[arg(long)]
    acl: Option<String>,

    /// Number of concurrent transfers
    #[arg(short, long, default_value_t = 8)]
    parallel: usize,

    /// Do not verify TLS certificates
    #[arg(long)]
    ssl_none: bool,

    /// Verbose logging, one line per transferred file
    #[arg(short = 'V', long)]
    verbose: bool,
}

async fn run(args: Args) -> anyhow::Result<SyncSummary> {
    let pair = SyncPair::parse(&args.source, &args.destination)?;

    let access_key = args.key.ok_or_else(|| {
        SyncError::Config("no access key, pass --key or set AWS_ACCESS_KEY_ID".to_string())
    })?;
    let secret_key = args.secret.ok_or_else(|| {
        SyncError::Config("no secret key, pass --secret or set AWS_SECRET_ACCESS_KEY".to_string())
    })?;

    let store = Arc::new(
        S3Store::new(S3Config {
            access_key,
            secret_key,
            region: args.region,
            endpoint: args.endpoint,
            accept_invalid_certs: args.ssl_none,
            acl: args.acl,
        })
        .context("failed to build S3 client")?,
    );

    let config = SyncConfig {
        parallel: args.parallel,
        verbose: args.verbose,
    };
    let executor = TransferExecutor::new(store.clone(), config.clone());

    Ok(sync_pair(&pair, store.as_ref(), &executor, &config).await?)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("s3_meta_sync={}", log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Source: {}", args.source);
    info!("Destination: {}", args.destination);

    match run(args).await {
        Ok(summary) => println!("{}", summary),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            let code = e
                .downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}
