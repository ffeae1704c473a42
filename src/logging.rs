use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Once;

use env_logger::{Env, Target};
use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_ONCE: Once = Once::new();
static ACTIVE_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("PARALYZER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

fn install(level: LevelFilter, target: Target) {
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .target(target)
            .try_init()
            .is_ok();
        if installed {
            let _ = ACTIVE_LEVEL.set(level);
        }
    });
}

/// Initialize stderr logging based on `PARALYZER_LOG`/`RUST_LOG`, or an explicit level.
pub fn init_logging(level: Option<&str>) {
    let level = parse_level(level).unwrap_or_else(env_level);
    install(level, Target::Stderr);
}

/// Initialize logging into a session log file instead of stderr.
///
/// Only the first initialization in a process takes effect.
pub fn init_file_logging(path: &Path, level: Option<&str>) -> io::Result<()> {
    let file = File::create(path)?;
    let level = parse_level(level).unwrap_or_else(env_level);
    install(level, Target::Pipe(Box::new(file)));
    Ok(())
}

/// Default session log file name, e.g. `session_20240101_120000.log`.
pub fn session_log_name(stamp: &str) -> String {
    format!("session_{stamp}.log")
}

/// Level the logger was installed with, if logging has been initialized here.
pub fn active_level() -> Option<LevelFilter> {
    ACTIVE_LEVEL.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_levels() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("WARN")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn level_names_round_trip() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
    }

    #[test]
    fn session_log_file_name() {
        assert_eq!(
            session_log_name("20240101_120000"),
            "session_20240101_120000.log"
        );
    }
}
