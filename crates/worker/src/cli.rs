use clap::{Parser, Subcommand};

use agentq_infra::config::env;

#[derive(Parser, Debug)]
#[command(
    name = "agentq-worker",
    version,
    about = "Agent job queue worker and operator commands",
    long_about = "Runs queue workers that execute agent jobs in isolated child processes, \
                  and submits, inspects and cancels jobs"
)]
pub struct Cli {
    /// Redis connection URL
    #[arg(long, global = true, env = env::REDIS_URL)]
    pub redis_url: Option<String>,

    /// Queue to work on or submit to
    #[arg(long, global = true, env = env::QUEUE_NAME)]
    pub queue: Option<String>,

    /// Worker id used for heartbeats (default: {hostname}-{pid})
    #[arg(long, global = true, env = env::WORKER_ID)]
    pub worker_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker loop until SIGINT/SIGTERM
    Run,

    /// Execute one agent request from stdin (used by the worker itself)
    #[command(name = "exec-agent", hide = true)]
    ExecAgent,

    /// Submit a job
    Submit {
        /// Agent name
        agent: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Deduplicate resubmissions with the same key
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Attempt ceiling (default from AGENTQ_JOB_MAX_ATTEMPTS)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Block up to this many seconds for a terminal status
        #[arg(long, value_name = "SECONDS")]
        wait: Option<f64>,
    },

    /// Show a job
    Status {
        job_id: String,

        /// Omit the result
        #[arg(long)]
        no_result: bool,
    },

    /// Request cancellation (honored only before the job is claimed)
    Cancel { job_id: String },

    /// Backend reachability and queue depths
    Health,

    /// List registered agents
    Agents {
        /// Run each agent's self-test instead
        #[arg(long)]
        health: bool,
    },
}
