mod handlers;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use warmbox_cli::{WarmboxArgs, WarmboxCliResult, WarmboxSubcommand, CROSS};
use warmbox_core::config::WarmboxConfig;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = WarmboxArgs::parse();

    // Initialize tracing. Verbosity flags win over RUST_LOG.
    let filter = match args.log_level() {
        Some(level) => EnvFilter::new(WarmboxArgs::log_filter(level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(WarmboxArgs::log_filter("info"))),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("{} {}", &*CROSS, e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: WarmboxArgs) -> WarmboxCliResult<()> {
    let config = WarmboxConfig::load(args.config.as_deref()).await?;

    match args.subcommand {
        WarmboxSubcommand::Run {
            code_dir,
            leaves,
            mem_limit_mb,
        } => handlers::run_subcommand(config, code_dir, leaves, mem_limit_mb).await,
        WarmboxSubcommand::Prewarm { take } => handlers::prewarm_subcommand(config, take).await,
    }
}
