use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use runner_host::{
    DEFAULT_WARMUP_CODE, DispatchSettings, RegisterWorkerRequest, create_server,
    load_seed_workers, resolve_workers_json_path,
};

// rmcp imports for MCP stdio server mode
use rmcp::service::ServiceExt;
use rmcp::transport::stdio;

const REGISTER_ATTEMPTS: u32 = 3;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "runner-host")]
#[command(about = "Dispatches code runs to a pool of remote executor workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DispatchArgs {
    /// Path to a workers.json file with seed workers
    #[arg(long, env = "RUNNER_WORKERS_CONFIG")]
    workers_config: Option<PathBuf>,
    /// Code sent to a candidate worker before it is admitted
    #[arg(long, env = "RUNNER_WARMUP_CODE", default_value = DEFAULT_WARMUP_CODE)]
    warmup_code: String,
    /// Execution timeout of the warm-up probe, in milliseconds
    #[arg(long, env = "RUNNER_WARMUP_TIMEOUT_MS", default_value_t = 30_000)]
    warmup_timeout_ms: u64,
    /// Lower bound for the deadline of a dispatched run, in milliseconds
    #[arg(long, env = "RUNNER_MIN_RUN_TIMEOUT_MS", default_value_t = 30_000)]
    min_run_timeout_ms: u64,
}

impl DispatchArgs {
    fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            warmup_code: self.warmup_code.clone(),
            warmup_timeout_ms: self.warmup_timeout_ms,
            min_run_timeout: Duration::from_millis(self.min_run_timeout_ms),
        }
    }

    fn seeds(&self) -> Result<Vec<RegisterWorkerRequest>> {
        match resolve_workers_json_path(self.workers_config.as_deref())? {
            Some(path) => {
                info!("Loading seed workers from {}", path.display());
                load_seed_workers(&path)
            }
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST API and the MCP endpoint over HTTP
    Serve {
        /// Bind address, e.g. 0.0.0.0:5050
        #[arg(long, env = "RUNNER_BIND", default_value = "0.0.0.0:5050")]
        bind: String,
        #[command(flatten)]
        dispatch: DispatchArgs,
    },
    /// Run as an MCP stdio server (for use in mcp.json)
    McpStdio {
        #[command(flatten)]
        dispatch: DispatchArgs,
    },
    /// Announce a worker to a running host
    Register {
        /// Base URL of the host, e.g. http://localhost:5050
        #[arg(long, env = "RUNNER_HOST_URL", default_value = "http://localhost:5050")]
        host: Url,
        /// Base URL of the worker being registered
        worker_url: Url,
        /// Run budget before the worker is retired (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_runs: i64,
    },
    /// Print the number of workers registered with a running host
    Count {
        #[arg(long, env = "RUNNER_HOST_URL", default_value = "http://localhost:5050")]
        host: Url,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("runner_host=info".parse()?)
                .add_directive("rmcp=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, dispatch } => {
            info!("Starting runner host on {}", bind);
            let server = create_server(dispatch.settings(), &dispatch.seeds()?).await?;
            runner_host::server::start_http(server, &bind).await?;
        }
        Commands::McpStdio { dispatch } => {
            info!("Starting MCP stdio server (rmcp)");

            let server = create_server(dispatch.settings(), &dispatch.seeds()?).await?;

            // Run as an MCP stdio server. McpServer implements ServerHandler.
            let service = server
                .as_ref()
                .clone()
                .serve(stdio())
                .await
                .inspect_err(|e| tracing::error!("serving error: {:?}", e))?;

            // Block until the MCP session ends.
            service.waiting().await?;
            server.dispatcher().shutdown();
            info!("MCP stdio server session ended");
        }
        Commands::Register {
            host,
            worker_url,
            max_runs,
        } => {
            let endpoint = host.join("/api/worker/register")?;
            let request = RegisterWorkerRequest::new(worker_url, max_runs);
            let client = reqwest::Client::new();

            let mut attempt = 1;
            loop {
                match register_once(&client, &endpoint, &request).await {
                    Ok(message) => {
                        println!("{}", message);
                        break;
                    }
                    Err(e) if attempt < REGISTER_ATTEMPTS => {
                        warn!(attempt, error = %e, "Registration attempt failed, retrying");
                        attempt += 1;
                        tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        return Err(e.context(format!(
                            "Registration failed after {} attempts",
                            REGISTER_ATTEMPTS
                        )));
                    }
                }
            }
        }
        Commands::Count { host } => {
            let endpoint = host.join("/api/worker/count")?;
            let count: usize = reqwest::get(endpoint)
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", count);
        }
    }

    Ok(())
}

async fn register_once(
    client: &reqwest::Client,
    endpoint: &Url,
    request: &RegisterWorkerRequest,
) -> Result<String> {
    let response = client.post(endpoint.clone()).json(request).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("Status code: {}, Response: {}", status, body);
    }
    Ok(body)
}
