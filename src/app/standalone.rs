use std::collections::BTreeMap;

use anyhow::*;
use clap::Parser;
use itertools::Itertools;
use mrlocal::standalone::{Args, Job};
use mrlocal::workload::{wc::WordCount, Workload};
use mrlocal::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args() -> (Job, u8) {
    let args = Args::parse();
    (Job::from(args.command), args.verbose)
}

fn print_results(results: &FinalResult<String, u64>, json: bool) -> Result<()> {
    if json {
        let sorted: BTreeMap<_, _> = results.iter().collect();
        println!("{}", serde_json::to_string_pretty(&sorted)?);
        return Ok(());
    }
    println!("--------------------------------------------------");
    println!("Word Frequency Results:");
    println!("--------------------------------------------------");
    for (word, count) in results
        .iter()
        .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
    {
        println!("{}: {}", word, count);
    }
    println!("--------------------------------------------------");
    println!("Total unique words found: {}", results.len());
    Ok(())
}

async fn run_standalone_mr_job(job: Job, workload: Workload) -> Result<()> {
    let config = job.engine_config()?;
    let inputs = utils::read_records(&job.input)?;
    info!(
        workload = workload.name(),
        records = inputs.len(),
        workers = config.workers,
        "starting standalone job"
    );

    // Ctrl-C abandons the run instead of leaving it half done.
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let results = match workload {
        Workload::WordCount => {
            Engine::with_config(WordCount, WordCount, config)?
                .try_run(inputs, token)
                .await?
        }
    };
    print_results(&results, job.json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let (job, verbose) = parse_args();
    init_logging(verbose);
    let workload = workload::named(&job.workload)?;

    run_standalone_mr_job(job, workload).await
}
