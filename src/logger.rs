//! Supports making the logging operations a true runtime no-op when the
//! `logger` feature is disabled.

#[cfg(feature = "logger")]
pub use log::{debug, error, info, trace, warn};

#[cfg(not(feature = "logger"))]
mod noop {
    // arguments are type-checked but never formatted or emitted
    macro_rules! trace {
        ($($arg:tt)*) => {{
            if false {
                let _ = format_args!($($arg)*);
            }
        }};
    }
    macro_rules! debug {
        ($($arg:tt)*) => {{
            if false {
                let _ = format_args!($($arg)*);
            }
        }};
    }
    macro_rules! info {
        ($($arg:tt)*) => {{
            if false {
                let _ = format_args!($($arg)*);
            }
        }};
    }
    macro_rules! warning {
        ($($arg:tt)*) => {{
            if false {
                let _ = format_args!($($arg)*);
            }
        }};
    }
    macro_rules! error {
        ($($arg:tt)*) => {{
            if false {
                let _ = format_args!($($arg)*);
            }
        }};
    }
    pub(crate) use {debug, error, info, trace, warning as warn};
}

#[cfg(not(feature = "logger"))]
pub(crate) use noop::{debug, error, info, trace, warn};
