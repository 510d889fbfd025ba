use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Конфигурация логирования
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Минимальный уровень логирования (перекрывается `RUST_LOG`)
    pub level: Level,
    /// Вывод в JSON формате
    pub json_output: bool,
    pub color_output: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_line_numbers: false,
        }
    }
}

impl LoggingConfig {
    /// Defaults, with JSON output switched on by `AI_GATEWAY_LOG_JSON=1`
    pub fn from_env() -> Self {
        let json_output = std::env::var("AI_GATEWAY_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            json_output,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_json(mut self, json_output: bool) -> Self {
        self.json_output = json_output;
        self
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        // JSON формат для production
        let subscriber = Registry::default().with(env_filter).with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_line_number(config.include_line_numbers)
                .with_writer(std::io::stderr),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // Человекочитаемый формат для разработки
        let subscriber = Registry::default().with(env_filter).with(
            fmt::layer()
                .with_target(true)
                .with_line_number(config.include_line_numbers)
                .with_ansi(config.color_output)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = LoggingConfig::default().with_level(Level::DEBUG).with_json(true);
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json_output);
    }
}
