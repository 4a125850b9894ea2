use std::io::IsTerminal;

use tracing::{ level_filters::LevelFilter, Subscriber };

pub fn verbosity_to_level_filter(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Logs go to stderr; stdout carries the report.
pub fn setup_logger(level: LevelFilter, json: bool) -> Box<dyn Subscriber + Send + Sync> {
    let builder = tracing_subscriber
        ::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);
    if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}
