//! Logger setup.
//!
//! Binaries call [`init_rust_logging`] for an `env_logger` on stderr. With the
//! `python` feature, [`init_python_logging`] routes `log` records into
//! Python's `logging` module instead, one Python logger per Rust target
//! (`remote_wiring::device` becomes `remote_wiring.device`).

use std::sync::Once;

use env_logger::Env;

/// Checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "REMOTE_WIRING_LOG";

static RUST_LOG_ONCE: Once = Once::new();

/// First of `REMOTE_WIRING_LOG` and `RUST_LOG` that is set.
fn filter_var(is_set: impl Fn(&str) -> bool) -> Option<&'static str> {
    [LOG_ENV_VAR, "RUST_LOG"].into_iter().find(|var| is_set(var))
}

fn log_env() -> Env<'static> {
    match filter_var(|var| std::env::var_os(var).is_some()) {
        Some(var) => Env::default().filter(var),
        None => Env::default().default_filter_or("info"),
    }
}

#[cfg(feature = "python")]
fn env_level() -> log::LevelFilter {
    std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| v.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info)
}

/// Install the stderr logger once; later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let _ = env_logger::Builder::from_env(log_env())
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python::{
    init_python_logging, reset_python_logging_cache, set_python_log_level,
    set_python_log_level_str,
};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::env_level;

    static BRIDGE: OnceCell<&'static PythonLogBridge> = OnceCell::new();

    /// Numeric level used by Python's `logging` for a `log` level.
    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    struct PythonLogBridge {
        max_level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        /// Python logger per dotted target, with the most verbose level it accepts.
        loggers: Mutex<HashMap<String, (LevelFilter, Py<PyAny>)>>,
    }

    impl PythonLogBridge {
        fn new(py: Python<'_>, max_level: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                max_level: Mutex::new(max_level),
                logging: py.import("logging")?.into(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn max_level(&self) -> LevelFilter {
            *self.max_level.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn accepted_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [
                Level::Trace,
                Level::Debug,
                Level::Info,
                Level::Warn,
                Level::Error,
            ] {
                let enabled = logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?;
                if enabled {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((level, logger)) = loggers.get(target) {
                return Ok((*level, logger.clone_ref(py)));
            }

            let logger = self
                .logging
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::accepted_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            loggers.insert(target.to_owned(), (level, logger.clone_ref(py)));
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (accepted, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > accepted || level > self.max_level() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    target.as_str(),
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PythonLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.max_level()
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.print(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) -> PyResult<&'static PythonLogBridge> {
        BRIDGE
            .get_or_try_init(|| {
                let bridge: &'static PythonLogBridge =
                    Box::leak(Box::new(PythonLogBridge::new(py, level)?));
                if log::set_logger(bridge).is_ok() {
                    log::set_max_level(level);
                }
                Ok(bridge)
            })
            .copied()
    }

    /// Route Rust log records into Python's `logging`. Idempotent.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        install(py, env_level()).map(|_| ())
    }

    /// Forget cached per-target loggers, e.g. after `logging.basicConfig`.
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            bridge
                .loggers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        let bridge = install(py, level)?;
        *bridge
            .max_level
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = level;
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }

    /// Like [`set_python_log_level`], falling back to the environment when
    /// `level` is missing or unparsable.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level
            .and_then(|s| s.parse::<LevelFilter>().ok())
            .unwrap_or_else(env_level);
        set_python_log_level(py, level)
    }
}
