use std::sync::{Arc, OnceLock};

/// Sink for log records emitted by secure storage.
///
/// Hosts implement this to route library logs into their own logging stack. Records never
/// contain key material, plaintext or ciphertext; entry names and backend kinds may appear.
///
/// # Examples
///
/// ```rust
/// use securestorage_core::logger::{LogLevel, Logger};
///
/// struct StdoutLogger;
///
/// impl Logger for StdoutLogger {
///     fn log(&self, level: LogLevel, message: String) {
///         println!("[{level:?}] {message}");
///     }
/// }
/// ```
///
/// ## Kotlin
///
/// ```kotlin
/// object SecureStorageLogBridge : Logger {
///     override fun log(level: LogLevel, message: String) {
///         Log.println(level.toAndroidPriority(), "SecureStorage", message)
///     }
/// }
///
/// // once, in Application.onCreate
/// setLogger(SecureStorageLogBridge)
/// ```
#[uniffi::export(with_foreign)]
pub trait Logger: Sync + Send {
    /// Receives one formatted log record.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LogLevel {
    /// Very detailed diagnostics.
    Trace,
    /// Debugging information.
    Debug,
    /// Normal progress, e.g. key generation.
    Info,
    /// Recoverable problems, e.g. a value that failed to decrypt.
    Warn,
    /// Failures surfaced to the caller.
    Error,
}

/// `log::Log` implementation that hands records to the registered [`Logger`].
struct ForeignLogger;

impl log::Log for ForeignLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let component = record.module_path().and_then(component);
        let verbose = matches!(record.level(), log::Level::Debug | log::Level::Trace);

        // other crates are only interesting from info upwards
        if verbose && component.is_none() {
            return;
        }

        let message = format_message(component, record.args());
        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(log_level(record.level()), message);
        } else {
            eprintln!("Logger not set: {message}");
        }
    }

    fn flush(&self) {}
}

/// Part of secure storage a record comes from, e.g. `keys::legacy`. `None` for other crates.
fn component(module_path: &str) -> Option<&str> {
    let rest = module_path.strip_prefix("securestorage_core")?;
    if rest.is_empty() {
        return Some("core");
    }
    rest.strip_prefix("::")
}

fn format_message(component: Option<&str>, args: &std::fmt::Arguments<'_>) -> String {
    component.map_or_else(|| args.to_string(), |component| format!("[{component}] {args}"))
}

const fn log_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Registers the host logger and installs the `log` bridge.
///
/// Only the first registration takes effect; later calls are reported on stdout and ignored.
#[uniffi::export]
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        println!("Logger already set");
    }

    if let Err(e) = init_logger() {
        eprintln!("Failed to set logger: {e}");
    }
}

fn init_logger() -> Result<(), log::SetLoggerError> {
    static LOGGER: ForeignLogger = ForeignLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
