use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value as JsonValue;
use tracing::info;

use agentq_agents::AgentRegistry;
use agentq_core::{JobId, WorkerId};
use agentq_infra::backend::{Backend, RedisBackend, SharedBackend};
use agentq_infra::jobs::{Heartbeat, JobQueue, JobStore, SubprocessRunner, Worker, run_child};
use agentq_infra::{AgentqConfig, JobService, SubmitRequest};

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only the worker loop logs to stdout; every other command prints data there.
    match cli.command {
        Commands::Run => agentq_observability::init(),
        _ => agentq_observability::init_stderr(),
    }
    let registry = AgentRegistry::with_builtin();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => run_worker(&config, registry),
        Commands::ExecAgent => exec_agent(&registry),
        Commands::Submit {
            agent,
            payload,
            idempotency_key,
            max_attempts,
            wait,
        } => {
            let payload: JsonValue =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let mut request = SubmitRequest::new(agent, payload).on_queue(&config.queue_name);
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(key);
            }
            if let Some(max_attempts) = max_attempts {
                request = request.with_max_attempts(max_attempts);
            }
            if let Some(secs) = wait {
                let timeout = Duration::try_from_secs_f64(secs)
                    .context("--wait must be a non-negative number of seconds")?;
                request = request.wait_for(timeout);
            }
            let response = service(&config, registry)?.submit(request)?;
            print_json(&response)
        }
        Commands::Status { job_id, no_result } => {
            let job_id = parse_job_id(&job_id)?;
            let view = service(&config, registry)?.status(&job_id, !no_result)?;
            print_json(&view)
        }
        Commands::Cancel { job_id } => {
            let job_id = parse_job_id(&job_id)?;
            service(&config, registry)?.cancel(&job_id)?;
            print_json(&serde_json::json!({ "ok": true, "job_id": job_id }))
        }
        Commands::Health => {
            let health = service(&config, registry)?.health(&config.queue_name);
            print_json(&health)
        }
        Commands::Agents { health } => {
            let service = service(&config, registry)?;
            if health {
                print_json(&service.agent_health())
            } else {
                print_json(&service.agents())
            }
        }
    }
}

/// Child mode: read one request from stdin, write one result line to stdout.
fn exec_agent(registry: &AgentRegistry) -> Result<()> {
    run_child(registry, io::stdin().lock(), io::stdout().lock())
        .context("failed to exchange messages with the worker")?;
    Ok(())
}

fn load_config(cli: &Cli) -> Result<AgentqConfig> {
    let mut config = AgentqConfig::from_env();
    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(queue) = &cli.queue {
        config.queue_name = queue.clone();
    }
    if let Some(raw) = &cli.worker_id {
        config.worker_id = WorkerId::new(raw.as_str()).context("invalid --worker-id")?;
    }
    Ok(config)
}

fn backend(config: &AgentqConfig) -> Result<SharedBackend> {
    let backend = RedisBackend::new(config.redis_backend_config())
        .with_context(|| format!("invalid redis url {}", config.redis_url))?;
    Ok(Arc::new(backend))
}

fn service(config: &AgentqConfig, registry: AgentRegistry) -> Result<JobService> {
    let backend = backend(config)?;
    let keys = config.keyspace();
    let store = JobStore::new(backend.clone(), keys.clone())
        .with_ttls(config.job_ttl, config.idempotency_ttl);
    Ok(JobService::new(backend, keys, store)
        .with_registry(registry)
        .with_default_queue(config.queue_name.clone())
        .with_default_max_attempts(config.max_attempts))
}

fn run_worker(config: &AgentqConfig, registry: AgentRegistry) -> Result<()> {
    let backend = backend(config)?;
    backend
        .ping()
        .with_context(|| format!("cannot reach {}", config.redis_url))?;

    let keys = config.keyspace();
    let store = JobStore::new(backend.clone(), keys.clone())
        .with_ttls(config.job_ttl, config.idempotency_ttl);
    let queue = JobQueue::new(backend.clone(), &keys, config.queue_name.clone());
    let heartbeat = Heartbeat::new(backend, keys, config.worker_id.clone(), registry.names())
        .with_ttl(config.heartbeat_ttl);
    let runner = SubprocessRunner::current_exe().context("cannot locate worker executable")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("failed to install signal handler")?;
    }

    info!(
        worker_id = %config.worker_id,
        queue = %config.queue_name,
        agents = ?registry.names(),
        job_timeout_secs = config.job_timeout.as_secs_f64(),
        "starting worker"
    );
    Worker::new(store, queue, heartbeat, runner, config.worker_config()).run_until(&shutdown);
    Ok(())
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse::<JobId>()
        .with_context(|| format!("invalid job id {raw:?}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
