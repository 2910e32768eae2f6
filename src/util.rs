use anyhow::anyhow;
use chrono::Utc;
use std::any::Any;
use std::time::Duration;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts a duration to milliseconds, saturating at `i64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Try to figure out what's in the box, and print it if we can.
///
/// The actual error type we will get from `panic::catch_unwind` is really poorly
/// documented. However, the `panic::set_hook` functions deal with a `PanicInfo`
/// type, and its payload is documented as "commonly but not always `&'static str`
/// or `String`". So we can try all of those, and give up if we didn't get one of
/// those three types.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("panicked: {message}")
    } else {
        anyhow!("panicked with a non-string payload")
    }
}
