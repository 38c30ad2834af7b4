use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use taskfleet::agent::AgentRuntime;
use taskfleet::config::{
    AgentConfig, ArtifactConfig, CoordinatorConfig, JobDefaults, RetryPolicy, SandboxBackend,
    SandboxConfig, SchedulerConfig,
};
use taskfleet::node::CoordinatorNode;
use taskfleet::registry::MAX_TIMEOUT_MS;
use taskfleet::proto::job_service_client::JobServiceClient;
use taskfleet::proto::{
    CancelJobRequest, GetJobStatusRequest, JobInfo, JobStatus, ListJobsRequest,
    ListWorkersRequest, SubmitJobRequest, WorkerStatus,
};
use taskfleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "taskfleet")]
#[command(version)]
#[command(about = "Distributes shell jobs across a pool of worker agents")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator (registry, scheduler and gRPC API)
    Server(ServerArgs),

    /// Start a worker agent
    Agent(AgentArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Worker inspection commands
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on for gRPC
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:50051")]
    listen: SocketAddr,

    /// Snapshot file for worker and job records (in-memory when omitted)
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Interval between scheduler passes
    #[arg(long, env = "SCHEDULER_TICK_MS", default_value = "5000")]
    scheduler_tick_ms: u64,

    /// Silence after which a worker is marked OFFLINE
    #[arg(long, env = "HEARTBEAT_TIMEOUT_MS", default_value = "30000")]
    heartbeat_timeout_ms: u64,

    /// Window during which a worker implicated in a failure gets no jobs
    #[arg(long, env = "AGENT_COOLDOWN_MS", default_value = "30000")]
    agent_cooldown_ms: u64,

    /// Slack past a job's timeout before the scheduler reclaims it
    #[arg(long, env = "TIMEOUT_GRACE_MS", default_value = "10000")]
    timeout_grace_ms: u64,

    /// Delay before a failed attempt is queued again
    #[arg(long, env = "RETRY_DELAY_MS", default_value = "0")]
    retry_delay_ms: u64,

    /// Weight of live CPU usage in placement
    #[arg(long, default_value = "0.5")]
    cpu_usage_weight: f64,

    /// Weight of reservation saturation in placement
    #[arg(long, default_value = "0.5")]
    saturation_weight: f64,

    /// How often heartbeat-only state is written to the state file
    #[arg(long, env = "STATE_FLUSH_INTERVAL_MS", default_value = "30000")]
    state_flush_interval_ms: u64,

    /// CPUs reserved for a job that does not ask
    #[arg(long, default_value = "1")]
    default_cpu: u32,

    /// RAM reserved for a job that does not ask, in MB
    #[arg(long, default_value = "256")]
    default_ram_mb: u64,

    /// Timeout for a job that does not set one
    #[arg(
        long,
        default_value = "600000",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_MS)
    )]
    default_timeout_ms: u64,

    /// Retries for a job that does not set them
    #[arg(long, default_value = "2")]
    default_max_retries: u32,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Coordinator address
    #[arg(long, short = 'c', env = "COORDINATOR_ADDR", default_value = "http://127.0.0.1:50051")]
    coordinator: String,

    /// Fixed worker id (otherwise persisted under --state-dir)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Directory holding the persisted worker id
    #[arg(long, env = "AGENT_STATE_DIR", default_value = ".taskfleet-agent")]
    state_dir: PathBuf,

    /// Parent directory for per-job workspaces
    #[arg(long, env = "AGENT_WORK_DIR")]
    work_dir: Option<PathBuf>,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "10000")]
    heartbeat_interval_ms: u64,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "5000")]
    poll_interval_ms: u64,

    /// Ceiling on concurrently executing jobs (default: cores / 2, min 1)
    #[arg(long, env = "MAX_PARALLEL_JOBS")]
    max_parallel_jobs: Option<usize>,

    /// RAM to advertise, in MB, when /proc/meminfo is unavailable
    #[arg(long, env = "RAM_TOTAL_MB")]
    ram_total_mb: Option<u64>,

    /// Registration attempts before giving up (default: retry forever)
    #[arg(long, env = "REGISTER_MAX_ATTEMPTS")]
    register_max_attempts: Option<u32>,

    #[arg(long, default_value = "500")]
    backoff_base_ms: u64,

    #[arg(long, default_value = "30000")]
    backoff_max_ms: u64,

    /// How long in-flight jobs may run on after shutdown is requested
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value = "30000")]
    shutdown_timeout_ms: u64,

    /// Isolation backend for job commands
    #[arg(long, env = "SANDBOX_BACKEND", default_value = "docker")]
    sandbox: SandboxBackend,

    /// Docker image to use for job execution
    #[arg(long, default_value = "alpine:latest")]
    image: String,

    /// Container runtime binary
    #[arg(long, default_value = "docker")]
    docker_binary: String,

    /// Give jobs network access
    #[arg(long)]
    allow_network: bool,

    #[arg(long, default_value = "256")]
    pids_limit: u64,

    #[arg(long, default_value = "64")]
    tmpfs_size_mb: u64,

    /// Bytes of stdout/stderr kept per stream
    #[arg(long, default_value = "1048576")]
    max_output_bytes: usize,

    /// Run job commands as `uid[:gid]` (docker backend)
    #[arg(long)]
    sandbox_user: Option<String>,

    /// A sandbox health check slower than this marks the agent unhealthy
    #[arg(long, default_value = "5000")]
    health_check_timeout_ms: u64,

    /// Accept file:// artifact URLs (reads the agent host's filesystem)
    #[arg(long)]
    allow_file_urls: bool,

    /// Largest input artifact accepted, in bytes
    #[arg(long, default_value = "536870912")]
    max_artifact_bytes: u64,

    /// Total bytes an artifact archive may expand to
    #[arg(long, default_value = "2147483648")]
    max_extracted_bytes: u64,
}

// =============================================================================
// Client Arguments (shared by job and worker commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', env = "COORDINATOR_ADDR", default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// The command to execute (e.g., "echo hello")
        command: String,

        /// Input artifact (http://, https:// or file://)
        #[arg(long)]
        file_url: Option<String>,

        /// Name the artifact is stored under in the workspace
        #[arg(long)]
        filename: Option<String>,

        #[arg(long)]
        cpu: Option<u32>,

        #[arg(long)]
        ram_mb: Option<u64>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a job that has not finished
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs, oldest first
    List {
        /// Number of jobs per page (default: 100, max: 1000)
        #[arg(long, default_value = "100")]
        page_size: u32,

        /// Fetch all pages automatically
        #[arg(long)]
        all: bool,

        /// Only jobs in this status (e.g. queued, running, failed)
        #[arg(long)]
        status: Option<String>,
    },
}

// =============================================================================
// Worker Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// List registered workers
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    submitted_at_ms: i64,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    status: String,
    command: String,
    attempts: u32,
    max_retries: u32,
    assigned_worker_id: Option<String>,
    executed_by: Option<String>,
    exit_code: Option<i32>,
    timed_out: bool,
    error_message: Option<String>,
    stdout: String,
    stderr: String,
    elapsed_ms: Option<u64>,
    submitted_at_ms: i64,
    completed_at_ms: Option<i64>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    status: String,
    command: String,
    worker: Option<String>,
    attempts: u32,
    submitted_at_ms: i64,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: u32,
    has_more: bool,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: String,
    hostname: String,
    os: String,
    status: String,
    cpu_count: u32,
    ram_total_mb: u64,
    reserved_cpu: u32,
    reserved_ram_mb: u64,
    cpu_usage_percent: f64,
    ram_free_mb: u64,
    current_job_ids: Vec<String>,
    max_parallel_jobs: u32,
    last_heartbeat_at_ms: i64,
    cooldown_until_ms: Option<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn job_status_to_string(status: i32) -> String {
    match JobStatus::try_from(status) {
        Ok(JobStatus::Unspecified) | Err(_) => "UNKNOWN".to_string(),
        Ok(s) => s
            .as_str_name()
            .trim_start_matches("JOB_STATUS_")
            .to_string(),
    }
}

fn worker_status_to_string(status: i32) -> String {
    match WorkerStatus::try_from(status) {
        Ok(WorkerStatus::Unspecified) | Err(_) => "UNKNOWN".to_string(),
        Ok(s) => s
            .as_str_name()
            .trim_start_matches("WORKER_STATUS_")
            .to_string(),
    }
}

fn parse_status_filter(raw: &str) -> Result<JobStatus, Box<dyn std::error::Error>> {
    let name = format!("JOB_STATUS_{}", raw.trim().to_uppercase().replace('-', "_"));
    JobStatus::from_str_name(&name)
        .filter(|s| *s != JobStatus::Unspecified)
        .ok_or_else(|| format!("unknown job status: {}", raw).into())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;
    Ok(endpoint.connect().await?)
}

// =============================================================================
// Server and Agent
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = CoordinatorConfig {
        listen_addr: args.listen,
        state_file: args.state_file,
        scheduler: SchedulerConfig {
            tick_interval_ms: args.scheduler_tick_ms,
            heartbeat_timeout_ms: args.heartbeat_timeout_ms,
            timeout_grace_ms: args.timeout_grace_ms,
            cpu_usage_weight: args.cpu_usage_weight,
            saturation_weight: args.saturation_weight,
            flush_interval_ms: args.state_flush_interval_ms,
        },
        retry: RetryPolicy {
            agent_cooldown_ms: args.agent_cooldown_ms,
            retry_delay_ms: args.retry_delay_ms,
        },
        job_defaults: JobDefaults {
            required_cpu: args.default_cpu,
            required_ram_mb: args.default_ram_mb,
            timeout_ms: args.default_timeout_ms,
            max_retries: args.default_max_retries,
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        state_file = ?config.state_file,
        tick_ms = config.scheduler.tick_interval_ms,
        heartbeat_timeout_ms = config.scheduler.heartbeat_timeout_ms,
        agent_cooldown_ms = config.retry.agent_cooldown_ms,
        "Starting taskfleet coordinator"
    );

    let shutdown = install_shutdown_handler();
    let node = CoordinatorNode::new(config)?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let defaults = AgentConfig::default();
    let config = AgentConfig {
        coordinator_addr: args.coordinator,
        worker_id: args.worker_id,
        state_dir: args.state_dir,
        work_dir: args.work_dir.unwrap_or(defaults.work_dir),
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        poll_interval_ms: args.poll_interval_ms,
        max_parallel_jobs: args
            .max_parallel_jobs
            .unwrap_or(defaults.max_parallel_jobs)
            .max(1),
        ram_total_mb: args.ram_total_mb,
        register_max_attempts: args.register_max_attempts,
        backoff_base_ms: args.backoff_base_ms,
        backoff_max_ms: args.backoff_max_ms,
        shutdown_timeout_ms: args.shutdown_timeout_ms,
        sandbox: SandboxConfig {
            backend: args.sandbox,
            docker_binary: args.docker_binary,
            image: args.image,
            network_disabled: !args.allow_network,
            pids_limit: args.pids_limit,
            tmpfs_size_mb: args.tmpfs_size_mb,
            max_output_bytes: args.max_output_bytes,
            user: args.sandbox_user,
            health_check_timeout_ms: args.health_check_timeout_ms,
        },
        artifacts: ArtifactConfig {
            allow_file_urls: args.allow_file_urls,
            max_download_bytes: args.max_artifact_bytes,
            max_extracted_bytes: args.max_extracted_bytes,
        },
    };

    tracing::info!(
        coordinator = %config.coordinator_addr,
        max_parallel_jobs = config.max_parallel_jobs,
        sandbox = ?config.sandbox.backend,
        work_dir = %config.work_dir.display(),
        "Starting taskfleet agent"
    );

    let shutdown = install_shutdown_handler();
    let runtime = AgentRuntime::from_config(config)?;
    runtime.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_job_submit(
    client: &mut JobServiceClient<Channel>,
    command: String,
    file_url: Option<String>,
    filename: Option<String>,
    cpu: Option<u32>,
    ram_mb: Option<u64>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .submit_job(SubmitJobRequest {
            command,
            file_url: file_url.unwrap_or_default(),
            filename: filename.unwrap_or_default(),
            required_cpu: cpu,
            required_ram_mb: ram_mb,
            timeout_ms,
            max_retries,
        })
        .await;

    let resp = match response {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Job submission failed: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: resp.job_id,
                submitted_at_ms: resp.submitted_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", resp.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut JobServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = match client.get_job_status(GetJobStatusRequest { job_id }).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                status: job_status_to_string(job.status),
                job_id: job.job_id,
                command: job.command,
                attempts: job.attempts,
                max_retries: job.max_retries,
                assigned_worker_id: job.assigned_worker_id,
                executed_by: job.executed_by,
                exit_code: job.exit_code,
                timed_out: job.timed_out,
                error_message: job.error_message,
                stdout: job.stdout,
                stderr: job.stderr,
                elapsed_ms: job.elapsed_ms,
                submitted_at_ms: job.submitted_at_ms,
                completed_at_ms: job.completed_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

fn print_job(job: &JobInfo) {
    println!("Job ID:          {}", job.job_id);
    println!("Status:          {}", job_status_to_string(job.status));
    println!("Command:         {}", job.command);
    println!("Attempts:        {} (max retries {})", job.attempts, job.max_retries);
    println!("Submitted:       {}", format_ms(job.submitted_at_ms));
    if let Some(worker) = &job.assigned_worker_id {
        println!("Assigned Worker: {}", worker);
    }
    if let Some(worker) = &job.executed_by {
        println!("Executed By:     {}", worker);
    }
    if let Some(exit_code) = job.exit_code {
        println!("Exit Code:       {}", exit_code);
    }
    if job.timed_out {
        println!("Timed Out:       yes");
    }
    if let Some(elapsed) = job.elapsed_ms {
        println!("Elapsed:         {} ms", elapsed);
    }
    if let Some(completed) = job.completed_at_ms {
        println!("Completed:       {}", format_ms(completed));
    }
    if let Some(message) = &job.error_message {
        println!("Error Message:   {}", message);
    }
    if !job.stdout.is_empty() {
        println!("Output:");
        for line in job.stdout.lines() {
            println!("  {}", line);
        }
    }
    if !job.stderr.is_empty() {
        println!("Error:");
        for line in job.stderr.lines() {
            println!("  {}", line);
        }
    }
}

async fn handle_job_cancel(
    client: &mut JobServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = match client
        .cancel_job(CancelJobRequest {
            job_id: job_id.clone(),
        })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Cancel failed: {}", status.message());
            std::process::exit(1);
        }
    };

    let status = job_status_to_string(resp.status);
    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job_id": job_id,
                    "status": status,
                }))?
            );
        }
        OutputFormat::Table => println!("Job {} is now {}", job_id, status),
    }
    Ok(())
}

async fn handle_job_list(
    client: &mut JobServiceClient<Channel>,
    page_size: u32,
    all: bool,
    status: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let status_filter = match status {
        Some(raw) => parse_status_filter(&raw)? as i32,
        None => JobStatus::Unspecified as i32,
    };

    let mut all_jobs: Vec<JobListItem> = Vec::new();
    let mut total_count;
    let mut has_more;
    let mut page_token = String::new();
    loop {
        let response = client
            .list_jobs(ListJobsRequest {
                page_size,
                page_token: page_token.clone(),
                status_filter,
            })
            .await?
            .into_inner();

        total_count = response.total_count;

        for job in response.jobs {
            all_jobs.push(JobListItem {
                status: job_status_to_string(job.status),
                worker: job.assigned_worker_id.or(job.executed_by),
                job_id: job.job_id,
                command: job.command,
                attempts: job.attempts,
                submitted_at_ms: job.submitted_at_ms,
            });
        }

        has_more = !response.next_page_token.is_empty();
        if !has_more || !all {
            break;
        }
        page_token = response.next_page_token;
    }

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                jobs: all_jobs,
                total_count,
                has_more,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if all_jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<20} {:<12} {:<4} COMMAND",
                    "JOB ID", "STATUS", "WORKER", "ATT"
                );
                println!("{}", "-".repeat(96));

                for job in &all_jobs {
                    let worker = job
                        .worker
                        .as_deref()
                        .map(|w| truncate(w, 12))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<20} {:<12} {:<4} {}",
                        job.job_id,
                        job.status,
                        worker,
                        job.attempts,
                        truncate(&job.command, 20)
                    );
                }
                println!();
                println!("Showing {} of {} jobs", all_jobs.len(), total_count);
                if has_more {
                    println!("(Use --all to fetch all pages)");
                }
            }
        }
    }
    Ok(())
}

async fn handle_worker_list(
    client: &mut JobServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .list_workers(ListWorkersRequest {})
        .await?
        .into_inner();

    let workers: Vec<WorkerOutput> = response
        .workers
        .into_iter()
        .map(|w| WorkerOutput {
            status: worker_status_to_string(w.status),
            worker_id: w.worker_id,
            hostname: w.hostname,
            os: w.os,
            cpu_count: w.cpu_count,
            ram_total_mb: w.ram_total_mb,
            reserved_cpu: w.reserved_cpu,
            reserved_ram_mb: w.reserved_ram_mb,
            cpu_usage_percent: w.cpu_usage_percent,
            ram_free_mb: w.ram_free_mb,
            current_job_ids: w.current_job_ids,
            max_parallel_jobs: w.max_parallel_jobs,
            last_heartbeat_at_ms: w.last_heartbeat_at_ms,
            cooldown_until_ms: w.cooldown_until_ms,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&workers)?);
        }
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:<10} {:>9} {:>13} {:>6} {:>5}  LAST HEARTBEAT",
                "WORKER ID", "HOST", "STATUS", "CPU", "RAM (MB)", "USE%", "JOBS"
            );
            println!("{}", "-".repeat(124));
            for w in &workers {
                let status = if w.cooldown_until_ms.is_some() {
                    format!("{}*", w.status)
                } else {
                    w.status.clone()
                };
                println!(
                    "{:<38} {:<16} {:<10} {:>9} {:>13} {:>6.1} {:>5}  {}",
                    truncate(&w.worker_id, 38),
                    truncate(&w.hostname, 16),
                    status,
                    format!("{}/{}", w.reserved_cpu, w.cpu_count),
                    format!("{}/{}", w.reserved_ram_mb, w.ram_total_mb),
                    w.cpu_usage_percent,
                    format!("{}/{}", w.current_job_ids.len(), w.max_parallel_jobs),
                    format_ms(w.last_heartbeat_at_ms)
                );
            }
            if workers.iter().any(|w| w.cooldown_until_ms.is_some()) {
                println!();
                println!("* cooldown recorded (may have expired)");
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            init_logging(&args.log_format);
            run_server(server_args).await?;
        }
        Commands::Agent(agent_args) => {
            init_logging(&args.log_format);
            run_agent(agent_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = JobServiceClient::new(channel);

            match command {
                JobCommands::Submit {
                    command: cmd,
                    file_url,
                    filename,
                    cpu,
                    ram_mb,
                    timeout_ms,
                    max_retries,
                } => {
                    handle_job_submit(
                        &mut grpc_client,
                        cmd,
                        file_url,
                        filename,
                        cpu,
                        ram_mb,
                        timeout_ms,
                        max_retries,
                        &client.output,
                    )
                    .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::List {
                    page_size,
                    all,
                    status,
                } => {
                    handle_job_list(&mut grpc_client, page_size, all, status, &client.output)
                        .await?;
                }
            }
        }
        Commands::Worker { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = JobServiceClient::new(channel);

            match command {
                WorkerCommands::List => {
                    handle_worker_list(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
