//! Process-wide error reporting channel.
//!
//! Every backend reports failures here in addition to encoding them into
//! the request status. A single callback slot can be installed with
//! [`set_error_callback`]; the last writer wins. Without a callback, reports
//! are emitted as structured `tracing` events.
//!
//! Reports are a side channel: nothing here reads or writes
//! [`Request::status`](crate::Request::status).

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::request::{Request, RequestSnapshot};

/// Receives every error report while installed.
pub type ErrorCallback = Arc<dyn Fn(&ErrorContext) + Send + Sync>;

static ERROR_CALLBACK: RwLock<Option<ErrorCallback>> = RwLock::new(None);

/// Source location of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

/// One error report.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Reporting backend or component (`"cpu"`, `"io_uring"`, `"vulkan"`).
    pub subsystem: String,
    /// Failing operation (`"pread"`, `"submit"`, `"vkQueueSubmit"`, ...).
    pub operation: String,
    pub detail: String,
    pub errno_value: i32,
    pub location: Location,
    pub timestamp: DateTime<Utc>,
    /// Identifying fields of the offending request, when there is one.
    pub request: Option<RequestSnapshot>,
}

impl ErrorContext {
    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }
}

/// Installs `callback` as the process-wide error sink, replacing any
/// previous one.
pub fn set_error_callback<F>(callback: F)
where
    F: Fn(&ErrorContext) + Send + Sync + 'static,
{
    *ERROR_CALLBACK.write().expect("error callback lock poisoned") = Some(Arc::new(callback));
}

/// Removes the installed callback; reports go to the default reporter again.
pub fn clear_error_callback() {
    *ERROR_CALLBACK.write().expect("error callback lock poisoned") = None;
}

/// Builds a report without request context and dispatches it.
///
/// Prefer the [`report_error!`](crate::report_error) macro, which fills in
/// the source location.
pub fn report_error(
    subsystem: &str,
    operation: &str,
    detail: &str,
    errno_value: i32,
    location: Location,
) {
    dispatch(&ErrorContext {
        subsystem: subsystem.to_owned(),
        operation: operation.to_owned(),
        detail: detail.to_owned(),
        errno_value,
        location,
        timestamp: Utc::now(),
        request: None,
    });
}

/// Builds a report embedding `request`'s key fields and dispatches it.
pub fn report_request_error(
    subsystem: &str,
    operation: &str,
    detail: &str,
    request: &Request,
    errno_value: i32,
    location: Location,
) {
    dispatch(&ErrorContext {
        subsystem: subsystem.to_owned(),
        operation: operation.to_owned(),
        detail: detail.to_owned(),
        errno_value,
        location,
        timestamp: Utc::now(),
        request: Some(request.snapshot()),
    });
}

fn dispatch(ctx: &ErrorContext) {
    // Clone out of the slot so the callback runs without the lock held.
    let callback = ERROR_CALLBACK
        .read()
        .expect("error callback lock poisoned")
        .clone();

    match callback {
        Some(callback) => callback(ctx),
        None => default_reporter(ctx),
    }
}

fn default_reporter(ctx: &ErrorContext) {
    match &ctx.request {
        Some(req) => tracing::error!(
            subsystem = %ctx.subsystem,
            operation = %ctx.operation,
            errno = ctx.errno_value,
            fd = req.fd,
            offset = req.offset,
            size = req.size,
            op = req.op.as_str(),
            file = ctx.location.file,
            line = ctx.location.line,
            function = ctx.location.function,
            timestamp = %ctx.timestamp.format("%Y-%m-%d %H:%M:%S"),
            "{}",
            ctx.detail
        ),
        None => tracing::error!(
            subsystem = %ctx.subsystem,
            operation = %ctx.operation,
            errno = ctx.errno_value,
            file = ctx.location.file,
            line = ctx.location.line,
            function = ctx.location.function,
            timestamp = %ctx.timestamp.format("%Y-%m-%d %H:%M:%S"),
            "{}",
            ctx.detail
        ),
    }
}

/// Expands to the [`Location`] of the call site.
#[doc(hidden)]
#[macro_export]
macro_rules! __location {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        $crate::report::Location {
            file: file!(),
            line: line!(),
            function: name.strip_suffix("::f").unwrap_or(name),
        }
    }};
}

/// Reports an error that is not tied to a request.
///
/// `report_error!(subsystem, operation, detail, errno)`
#[macro_export]
macro_rules! report_error {
    ($subsystem:expr, $operation:expr, $detail:expr, $errno:expr $(,)?) => {
        $crate::report::report_error(
            $subsystem,
            $operation,
            &$detail,
            $errno,
            $crate::__location!(),
        )
    };
}

/// Reports an error for a specific request.
///
/// `report_request_error!(subsystem, operation, detail, &request, errno)`
#[macro_export]
macro_rules! report_request_error {
    ($subsystem:expr, $operation:expr, $detail:expr, $request:expr, $errno:expr $(,)?) => {
        $crate::report::report_request_error(
            $subsystem,
            $operation,
            &$detail,
            $request,
            $errno,
            $crate::__location!(),
        )
    };
}
