use crate::domain::settings::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Targets the packet diagnostics log under.
const PACKET_TARGETS: [&str; 2] = ["ac_infinity_ble::packets", "ac_infinity_ble::learning"];

pub struct LoggingGuard {
    // We need to keep this guard alive for logs to be flushed
    _guards: Vec<WorkerGuard>,
}

/// Filter directives for the configured level. Packet dumps are logged at
/// debug, so they get their own directive when packet logging is on.
fn filter_directives(settings: &LogSettings, packet_logging: bool) -> String {
    let mut directives = vec![settings.level.trim().to_lowercase()];
    if packet_logging {
        directives.extend(PACKET_TARGETS.iter().map(|t| format!("{}=debug", t)));
    }
    directives.join(",")
}

/// Adds the packet debug directives to a filter built elsewhere (RUST_LOG).
fn with_packet_targets(mut filter: EnvFilter) -> EnvFilter {
    for target in PACKET_TARGETS {
        match format!("{}=debug", target).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring packet log directive for {}: {}", target, e),
        }
    }
    filter
}

fn rotation(name: &str) -> tracing_appender::rolling::Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::Rotation::HOURLY,
        "minutely" => tracing_appender::rolling::Rotation::MINUTELY,
        "never" => tracing_appender::rolling::Rotation::NEVER,
        _ => tracing_appender::rolling::Rotation::DAILY,
    }
}

pub fn init_logger(settings: &LogSettings, packet_logging: bool) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // RUST_LOG wins over the settings file level; packet logging still applies
    let level_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if packet_logging => with_packet_targets(filter),
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(settings, packet_logging))
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // Console layer
    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    // File layer
    let file_layer = if settings.file_logging_enabled {
        std::fs::create_dir_all(&settings.log_dir)?;
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging initialized successfully");

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_logging_adds_debug_targets() {
        let settings = LogSettings {
            level: "WARN ".to_string(),
            ..Default::default()
        };
        assert_eq!(filter_directives(&settings, false), "warn");
        assert_eq!(
            filter_directives(&settings, true),
            "warn,ac_infinity_ble::packets=debug,ac_infinity_ble::learning=debug"
        );
        assert!(EnvFilter::try_new(filter_directives(&settings, true)).is_ok());
    }

    #[test]
    fn test_env_filter_keeps_packet_targets() {
        let filter = with_packet_targets(EnvFilter::new("warn")).to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("ac_infinity_ble::packets=debug"));
        assert!(filter.contains("ac_infinity_ble::learning=debug"));
    }

    #[test]
    fn test_unknown_rotation_is_daily() {
        use tracing_appender::rolling::Rotation;
        assert_eq!(rotation("weekly"), Rotation::DAILY);
        assert_eq!(rotation("Hourly"), Rotation::HOURLY);
    }
}
