use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};
use url::Url;

use crate::events::{DEFAULT_RUN_TIMEOUT_MS, RunCodeRequest};
use crate::registration::RegisterWorkerRequest;

pub const DEFAULT_WARMUP_CODE: &str = "Console.WriteLine(\"Hello World!\");";

/// Tunables for registration probes and dispatched runs.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Code sent to a candidate worker before it is admitted.
    pub warmup_code: String,
    /// Execution timeout declared on the warm-up request; the probe itself
    /// may take twice as long.
    pub warmup_timeout_ms: u64,
    /// Lower bound for the deadline of a dispatched run.
    pub min_run_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            warmup_code: DEFAULT_WARMUP_CODE.to_string(),
            warmup_timeout_ms: DEFAULT_RUN_TIMEOUT_MS,
            min_run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
        }
    }
}

impl DispatchSettings {
    pub fn warm_up_request(&self) -> RunCodeRequest {
        RunCodeRequest::warm_up(self.warmup_code.clone(), self.warmup_timeout_ms)
    }

    pub fn run_timeout(&self, request: &RunCodeRequest) -> Duration {
        request.remote_timeout(self.min_run_timeout)
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkersJsonConfig {
    #[serde(default)]
    pub workers: Vec<SeedWorkerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SeedWorkerConfig {
    pub url: String,
    #[serde(default, rename = "maxRuns")]
    pub max_runs: i64,
    #[serde(default)]
    pub disabled: bool,
}

/// Locate the seed-worker file.
///
/// An explicit path (flag or `RUNNER_WORKERS_CONFIG`) must exist; otherwise
/// `$XDG_CONFIG_HOME/runner-host/workers.json` and `./workers.json` are tried,
/// and having neither is fine.
pub fn resolve_workers_json_path(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let explicit = explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var("RUNNER_WORKERS_CONFIG").ok().map(PathBuf::from));
    if let Some(p) = explicit {
        if !p.exists() {
            return Err(anyhow::anyhow!(
                "Workers config {} does not exist",
                p.display()
            ));
        }
        return Ok(Some(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("runner-host").join("workers.json");
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }

    let candidate = PathBuf::from("workers.json");
    if candidate.exists() {
        return Ok(Some(candidate));
    }

    Ok(None)
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Parse a seed-worker file into registration requests, skipping disabled
/// entries.
pub fn load_seed_workers(path: &Path) -> anyhow::Result<Vec<RegisterWorkerRequest>> {
    let raw = fs::read_to_string(path)?;
    let cfg: WorkersJsonConfig = serde_json::from_str(&raw)?;

    let mut seeds = Vec::new();
    for worker in cfg.workers.into_iter().filter(|w| !w.disabled) {
        let expanded = expand_env_vars(&worker.url);
        let url = Url::parse(&expanded)
            .map_err(|e| anyhow::anyhow!("Invalid worker url `{}`: {}", expanded, e))?;
        seeds.push(RegisterWorkerRequest::new(url, worker.max_runs));
    }

    Ok(seeds)
}
