use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ss_client::output::{Out, STATUS_OK};
use ss_client::progress::{ConsoleProgress, ProgressUpdater};
use ss_client::stack::UnconfiguredStack;
use ss_client::{ClientError, LightClient, DEFAULT_TIMEOUT};

mod cli;
use cli::Cli;

const DEFAULT_API: &str = "http://bootstrap1.stream.space:4343";

fn init_logging(to_stderr: bool) {
    // Logs always go to stderr so the result envelope owns stdout; the flag
    // only decides how chatty the default is.
    let default_level = if to_stderr { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_logging(args.log_to_stderr);

    let timeout = match humantime::parse_duration(&args.timeout) {
        Ok(t) => t,
        Err(_) => {
            tracing::warn!(given = %args.timeout, "invalid timeout duration, using default 45m");
            DEFAULT_TIMEOUT
        }
    };

    let client = LightClient::new(
        args.dst.clone(),
        DEFAULT_API,
        timeout,
        Arc::new(UnconfiguredStack),
    );
    let progress = args
        .progress
        .then(|| Arc::new(ConsoleProgress) as Arc<dyn ProgressUpdater>);

    let out = match client.start(&args.sharable, args.info, progress).await {
        Ok(outcome) => {
            let mut out = Out::new(STATUS_OK, outcome.message);
            if let Some(data) = outcome.data {
                // Receipts and stats are only surfaced when asked for.
                out = out.with_data(if args.stat || args.info {
                    data
                } else {
                    data.get("file").cloned().unwrap_or(data)
                });
            }
            out
        }
        Err(e) => err_out(&e),
    };

    println!("{}", out.render(args.json));
    if out.status == STATUS_OK {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn err_out(err: &ClientError) -> Out {
    Out::new(err.status(), err.to_string()).with_details(err.details())
}
