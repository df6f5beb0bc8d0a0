use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn env_var_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        }
        Err(_) => false,
    }
}

/// Reads and parses an environment variable, ignoring it when unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Worker count used when the caller asks for the platform default (0).
pub fn platform_workers() -> usize {
    num_cpus::get().max(1)
}

/// Identifier for one local run, unique enough to keep concurrent runs' spill dirs apart.
pub fn local_run_id() -> String {
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("local-{}-{}", pid, ts)
}
