use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use crate::config::EngineConfig;

pub mod engine;
pub mod orchestrator;
pub mod phase;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job over local files in this process
    Submit {
        /// Glob spec for the input files
        #[arg(short, long)]
        input: String,

        /// Name of the workload
        #[arg(short, long, default_value = "wc")]
        workload: String,

        /// [OPT] Maximum number of concurrent map/reduce workers
        #[arg(short = 'n', long)]
        workers: Option<usize>,

        /// [OPT] Capacity of each stage's result channel
        #[arg(long)]
        channel_capacity: Option<usize>,

        /// [OPT] JSON file with engine settings; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the result as a JSON object
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub input: String,
    pub workload: String,
    pub workers: Option<usize>,
    pub channel_capacity: Option<usize>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

impl From<Commands> for Job {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Submit {
                input,
                workload,
                workers,
                channel_capacity,
                config,
                json,
            } => Job {
                input,
                workload,
                workers,
                channel_capacity,
                config,
                json,
            },
        }
    }
}

impl Job {
    /// Settings for this job: the config file if given, else defaults,
    /// with command-line flags applied on top.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(channel_capacity) = self.channel_capacity {
            config.channel_capacity = channel_capacity;
        }
        config.validate()?;
        Ok(config)
    }
}
