use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};

/// Writes timestamped log lines to stderr, leaving stdout to the console.
pub struct ConsoleLogger {
    level: Level,
}

impl ConsoleLogger {
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Installs the logger. Fails if another logger is already installed.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger: &'static ConsoleLogger = Box::leak(Box::new(ConsoleLogger::new(level)));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))
    }

    fn format(&self, record: &Record) -> String {
        format!(
            "{} [{}] {}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", self.format(record));
        }
    }

    fn flush(&self) {}
}
