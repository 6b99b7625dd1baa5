use std::io::Write;

use log::LevelFilter;

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level for the application (default: INFO)
    pub level: LevelFilter,
    /// Prefix printed on every line, usually the process title
    pub title: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            title: None,
        }
    }
}

/// Initialize the global logger
///
/// `RUST_LOG`, when set, overrides the configured level. Calling this more
/// than once is harmless.
pub fn init_logging(config: LoggingConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    let title = config.title;
    builder.format(move |buf, record| {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        match &title {
            Some(title) => writeln!(
                buf,
                "{} - {} - {} - {}",
                timestamp,
                title,
                record.level(),
                record.args()
            ),
            None => writeln!(buf, "{} - {} - {}", timestamp, record.level(), record.args()),
        }
    });

    let _ = builder.try_init();
}
