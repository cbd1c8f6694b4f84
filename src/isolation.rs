//! Time-boxed execution of plugin code.
//!
//! A call runs on its own named OS thread and the caller waits on a channel
//! with a deadline. A call that misses its deadline is abandoned, not killed:
//! the thread keeps running until the plugin code returns on its own.
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use dashmap::DashMap;
use opentelemetry::KeyValue;
use tracing::{debug, warn};
use wiseflow_plugin::PluginError;

use crate::{logger::metrics, util::panic_message};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PluginIsolationManager {
    enabled: Arc<AtomicBool>,
    default_timeout: Duration,
    plugin_timeouts: Arc<DashMap<String, Duration>>,
}

impl Default for PluginIsolationManager {
    fn default() -> Self {
        Self::new(true, DEFAULT_TIMEOUT)
    }
}

impl PluginIsolationManager {
    pub fn new(enabled: bool, default_timeout: Duration) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            default_timeout,
            plugin_timeouts: Arc::new(DashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_plugin_timeout(&self, plugin: &str, timeout: Duration) {
        self.plugin_timeouts.insert(plugin.to_string(), timeout);
    }

    pub fn clear_plugin_timeout(&self, plugin: &str) {
        self.plugin_timeouts.remove(plugin);
    }

    pub fn timeout_for(&self, plugin: &str) -> Duration {
        self.plugin_timeouts
            .get(plugin)
            .map(|t| *t)
            .unwrap_or(self.default_timeout)
    }

    /// A runner bound to `plugin`'s timeout and the current isolation setting.
    pub fn isolate(&self, plugin: &str) -> IsolatedCall {
        IsolatedCall {
            plugin: plugin.to_string(),
            timeout: self.timeout_for(plugin),
            inline: !self.is_enabled(),
        }
    }
}

/// Applies isolation to one callable at a time. See [`PluginIsolationManager::isolate`].
#[derive(Debug, Clone)]
pub struct IsolatedCall {
    plugin: String,
    timeout: Duration,
    inline: bool,
}

impl IsolatedCall {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `f`; any error, panic or timeout comes back as
    /// [`PluginError::Execution`] naming the plugin and `operation`.
    pub fn run<F, T>(&self, operation: &str, f: F) -> Result<T, PluginError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let result = if self.inline {
            run_caught(f)
        } else {
            self.run_bounded(operation, f)
        };
        metrics().plugin_call_latency_ms.record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("plugin", self.plugin.clone()),
                KeyValue::new("operation", operation.to_string()),
            ],
        );
        result.map_err(|source| PluginError::Execution {
            plugin: self.plugin.clone(),
            operation: operation.to_string(),
            source,
        })
    }

    fn run_bounded<F, T>(&self, operation: &str, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name(format!("plugin-{}-{}", self.plugin, operation))
            .spawn(move || {
                // receiver is gone once the caller has timed out
                let _ = tx.send(run_caught(f));
            })
            .map_err(|e| anyhow!("could not spawn isolation thread: {e}"))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                debug!(plugin = %self.plugin, operation, "isolated call finished");
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                metrics()
                    .isolation_timeouts
                    .add(1, &[KeyValue::new("plugin", self.plugin.clone())]);
                warn!(
                    plugin = %self.plugin,
                    operation,
                    timeout = ?self.timeout,
                    "isolated call timed out, leaving it to finish in the background"
                );
                Err(PluginError::Timeout {
                    plugin: self.plugin.clone(),
                    operation: operation.to_string(),
                    timeout: self.timeout,
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("isolation thread exited without a result"))
            }
        }
    }
}

fn run_caught<F, T>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiseflow_plugin::PluginErrorKind;

    #[test]
    fn times_out_within_the_window() {
        let iso = PluginIsolationManager::new(true, Duration::from_secs(10));
        iso.set_plugin_timeout("sleepy", Duration::from_millis(100));

        let started = Instant::now();
        let err = iso
            .isolate("sleepy")
            .run("initialize", || {
                thread::sleep(Duration::from_secs(3));
                Ok(())
            })
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
        assert!(err.is_timeout());
        assert_eq!(err.kind(), PluginErrorKind::Execution);
        assert_eq!(err.plugin(), Some("sleepy"));
    }

    #[test]
    fn errors_and_panics_are_wrapped() {
        let iso = PluginIsolationManager::default();
        let call = iso.isolate("flaky");

        let err = call.run("process", || -> anyhow::Result<()> { anyhow::bail!("bad input") }).unwrap_err();
        match &err {
            PluginError::Execution { plugin, operation, source } => {
                assert_eq!(plugin, "flaky");
                assert_eq!(operation, "process");
                assert_eq!(source.to_string(), "bad input");
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(!err.is_timeout());

        let err = call.run("process", || -> anyhow::Result<()> { panic!("kaboom") }).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn values_come_back() {
        let iso = PluginIsolationManager::default();
        let v = iso.isolate("calc").run("analyze", || Ok(6 * 7)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn disabled_isolation_runs_inline() {
        let iso = PluginIsolationManager::new(false, Duration::from_millis(10));
        let caller = thread::current().id();
        let ran_on = iso
            .isolate("inline")
            .run("initialize", move || {
                thread::sleep(Duration::from_millis(30));
                Ok(thread::current().id())
            })
            .unwrap();
        assert_eq!(ran_on, caller);

        iso.set_enabled(true);
        assert!(iso.isolate("inline").run("initialize", || Ok(())).is_ok());
    }

    #[test]
    fn per_plugin_timeouts() {
        let iso = PluginIsolationManager::new(true, Duration::from_secs(5));
        iso.set_plugin_timeout("fast", Duration::from_millis(50));
        assert_eq!(iso.timeout_for("fast"), Duration::from_millis(50));
        assert_eq!(iso.timeout_for("other"), Duration::from_secs(5));
        iso.clear_plugin_timeout("fast");
        assert_eq!(iso.isolate("fast").timeout(), Duration::from_secs(5));
    }
}
