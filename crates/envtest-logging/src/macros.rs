//! ---
//! envtest_section: "03-logging"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Structured logging adapters and sinks."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Logging macros that attach a [`LogContext`](crate::LogContext) as fields.

#[doc(hidden)]
#[macro_export]
macro_rules! __harness_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        $crate::__tracing::event!(
            $level,
            suite = ctx.suite.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            resource = ctx.resource.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a debug log enriched with harness context.
#[macro_export]
macro_rules! harness_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an informational log enriched with harness context.
#[macro_export]
macro_rules! harness_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with harness context.
#[macro_export]
macro_rules! harness_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with harness context.
#[macro_export]
macro_rules! harness_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__harness_event!($crate::__tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
