//! Log output that respects the per-thread no-log level.
//!
//! Records go through `env_logger`, filtered by `LOCKSTEP_LOG` (same syntax
//! as `RUST_LOG`).  A thread that is inside a no-log section emits nothing,
//! and writing a record raises the level for its duration so that an
//! intercepted `write` underneath cannot log back into us.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::thread_state::{self, NoLogGuard};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "LOCKSTEP_LOG";

pub struct GuardedLogger {
    inner: env_logger::Logger,
}

impl GuardedLogger {
    pub fn new(inner: env_logger::Logger) -> Self {
        Self { inner }
    }

    pub fn filter(&self) -> LevelFilter {
        self.inner.filter()
    }
}

fn suppressed() -> bool {
    thread_state::try_current().is_some_and(|ctx| ctx.is_no_log())
}

impl Log for GuardedLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        !suppressed() && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if suppressed() || !self.inner.matches(record) {
            return;
        }
        let _quiet = thread_state::try_current().map(NoLogGuard::on);
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the logger.  Defaults to `info` when `LOCKSTEP_LOG` is unset.
pub fn init() -> Result<(), SetLoggerError> {
    let inner = env_logger::Builder::from_env(env_logger::Env::default().filter_or(LOG_ENV, "info"))
        .format_timestamp_micros()
        .build();
    let logger = GuardedLogger::new(inner);
    let level = logger.filter();
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn logger(filter: &str) -> GuardedLogger {
        GuardedLogger::new(env_logger::Builder::new().parse_filters(filter).is_test(true).build())
    }

    fn meta(level: Level) -> Metadata<'static> {
        Metadata::builder().level(level).target("lockstep_runtime").build()
    }

    #[test]
    fn filter_applies() {
        let l = logger("warn");
        assert_eq!(l.filter(), LevelFilter::Warn);
        assert!(l.enabled(&meta(Level::Error)));
        assert!(!l.enabled(&meta(Level::Info)));
    }

    #[test]
    fn no_log_section_silences_the_thread() {
        let l = logger("trace");
        std::thread::spawn(move || {
            let ctx = thread_state::current();
            assert!(l.enabled(&meta(Level::Info)));
            {
                let _g = NoLogGuard::on(ctx);
                assert!(!l.enabled(&meta(Level::Error)));
            }
            assert!(l.enabled(&meta(Level::Info)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn threads_without_context_still_log() {
        let l = logger("debug");
        std::thread::spawn(move || {
            assert!(thread_state::try_current().is_none());
            assert!(l.enabled(&meta(Level::Debug)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn writing_a_record_restores_the_level() {
        let l = logger("info");
        std::thread::spawn(move || {
            let ctx = thread_state::current();
            let before = ctx.counters();
            l.log(
                &Record::builder()
                    .level(Level::Info)
                    .target("lockstep_runtime")
                    .args(format_args!("frame {}", 1))
                    .build(),
            );
            assert_eq!(ctx.counters(), before);
        })
        .join()
        .unwrap();
    }
}
