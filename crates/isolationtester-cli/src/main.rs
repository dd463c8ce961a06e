//! `isolationtester [-n] <SPEC-FILE> [CONNINFO]` (§6): parse a spec file,
//! wire up logging, and drive an isolation test run to completion with the
//! correct process exit code.

use anyhow::Context;
use clap::Parser;
use isolationtester::{db, spec_format, Driver};
use itertools::Itertools;
use std::io::{Read, Write};

/// Interleaves SQL steps from concurrent sessions to exercise a database's
/// concurrency control, emitting a byte-stable transcript on stdout.
#[derive(Debug, Parser)]
#[command(name = "isolationtester", version, about, long_about = None)]
struct Cli {
    /// Print every permutation in spec-file syntax instead of running the test.
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Spec file to read, or "-" for stdin.
    #[arg(value_parser)]
    spec_file: clio::Input,

    /// Connection string used by sessions whose spec declares no connection
    /// at all. Defaults to `dbname = postgres`.
    conninfo: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_ansi(false)
        // stdout is the transcript; every log line goes to stderr.
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(mut cli: Cli) -> anyhow::Result<()> {
    let mut text = String::new();
    cli.spec_file
        .read_to_string(&mut text)
        .context("reading spec file")?;
    let spec = spec_format::parse(&text).context("parsing spec file")?;

    let mut stdout = std::io::stdout().lock();

    if cli.dry_run {
        Driver::dry_run(&spec, &mut stdout)?;
        return Ok(());
    }

    tracing::info!(
        sessions = %spec.sessions.iter().map(|s| s.name.as_str()).join(", "),
        "loaded spec",
    );

    let default_connstring = cli.conninfo.as_deref().unwrap_or("dbname = postgres");
    let mut driver = Driver::connect(spec, default_connstring)
        .await
        .context("opening connections")?;

    // Setup and teardown run fresh around each permutation inside
    // `Driver::run`; there is nothing left to do here but close up.
    let run_result = driver
        .run(&mut stdout, db::DEFAULT_POLL_INTERVAL)
        .await
        .map(|_outcomes| ());
    let _ = stdout.flush();

    driver.close();

    run_result
}
