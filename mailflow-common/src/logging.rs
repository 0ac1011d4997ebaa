use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Queue lifecycle and persistence events
#[macro_export]
macro_rules! queue {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "queue", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::queue!(level = TRACE, $($msg),*)
    };
}

/// Routing decisions made by processor chains
#[macro_export]
macro_rules! routing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "routing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::routing!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn is_mailflow(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target().starts_with("mailflow")
}

fn only_mailflow() -> FilterFn {
    FilterFn::new(is_mailflow as fn(&tracing::Metadata<'_>) -> bool)
}

/// Install the global subscriber
///
/// `LOG_LEVEL` picks the level, `LOG_FORMAT=json` switches to JSON lines.
/// Calling this more than once is harmless: later calls are ignored.
pub fn init() {
    let level = level_from_env();
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(only_mailflow())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(only_mailflow())
            .boxed()
    };

    let _ = tracing_subscriber::Registry::default().with(layer).try_init();
}
