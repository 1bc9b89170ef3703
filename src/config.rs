use std::path::PathBuf;
use std::time::Duration;

/// Transport configuration shared by [`crate::RpcServer`] and
/// [`crate::RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub cert_path: PathBuf,

    pub key_path: Option<PathBuf>,

    pub server_name: String,

    pub bind_address: String,

    pub keep_alive_interval: Option<Duration>,

    /// Deadline applied to calls that do not set their own.
    pub default_deadline: Option<Duration>,

    pub max_concurrent_calls: u64,
}

impl RpcConfig {
    pub fn new<P: Into<PathBuf>>(cert_path: P, bind_address: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: None,
            server_name: "localhost".to_string(),
            bind_address: bind_address.into(),
            keep_alive_interval: Some(Duration::from_secs(30)),
            default_deadline: None,
            max_concurrent_calls: 1_000,
        }
    }

    pub fn with_key_path<P: Into<PathBuf>>(mut self, key_path: P) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    pub fn with_default_deadline(mut self, timeout: Duration) -> Self {
        self.default_deadline = Some(timeout);
        self
    }

    pub fn with_max_concurrent_calls(mut self, calls: u64) -> Self {
        self.max_concurrent_calls = calls;
        self
    }
}

/// Pacing of the simulated work done by `SumWithDeadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculatorConfig {
    pub work_step: Duration,
    pub work_steps: u32,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            work_step: Duration::from_secs(1),
            work_steps: 3,
        }
    }
}

impl CalculatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_step(mut self, step: Duration) -> Self {
        self.work_step = step;
        self
    }

    pub fn with_work_steps(mut self, steps: u32) -> Self {
        self.work_steps = steps;
        self
    }

    /// Total time the simulated work takes when it is not interrupted.
    pub fn total_work(&self) -> Duration {
        self.work_step.saturating_mul(self.work_steps)
    }
}

pub mod runtime {
    //! Helpers for configuring Tokio runtimes.
    use std::{env, thread};

    /// Environment variable that controls the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "CALCNET_SERVER_THREADS";

    /// Worker thread count from [`SERVER_THREADS_ENV`], or the number of
    /// available CPU threads.
    pub fn server_worker_threads() -> usize {
        env::var(SERVER_THREADS_ENV)
            .ok()
            .and_then(|raw| parse_threads(&raw))
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    fn parse_threads(raw: &str) -> Option<usize> {
        let value = raw.trim().parse::<usize>().ok()?;
        (value > 0).then_some(value)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_threads_rejects_invalid_values() {
            assert_eq!(parse_threads("0"), None);
            assert_eq!(parse_threads("-1"), None);
            assert_eq!(parse_threads("abc"), None);
        }

        #[test]
        fn parse_threads_accepts_positive_values() {
            assert_eq!(parse_threads("8"), Some(8));
            assert_eq!(parse_threads(" 4 "), Some(4));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_config_builder() {
        let config = RpcConfig::new("certs/cert.pem", "127.0.0.1:0")
            .with_key_path("certs/key.pem")
            .with_server_name("calc.local")
            .with_default_deadline(Duration::from_secs(5))
            .with_max_concurrent_calls(64);

        assert_eq!(config.key_path, Some(PathBuf::from("certs/key.pem")));
        assert_eq!(config.server_name, "calc.local");
        assert_eq!(config.default_deadline, Some(Duration::from_secs(5)));
        assert_eq!(config.max_concurrent_calls, 64);
        assert_eq!(config.keep_alive_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn calculator_defaults_to_three_one_second_steps() {
        let config = CalculatorConfig::default();
        assert_eq!(config.total_work(), Duration::from_secs(3));

        let fast = config.with_work_step(Duration::from_millis(10));
        assert_eq!(fast.total_work(), Duration::from_millis(30));
    }
}
