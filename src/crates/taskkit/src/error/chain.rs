//! Error chain helpers
//!
//! Used to render the full causal chain of a terminal failure before it is
//! logged and returned.

use std::error::Error as StdError;
use std::fmt::Write;

/// Format an error chain as a multi-line string
///
/// Walks the error chain via `source()` and formats each error
/// on a separate line with indentation.
///
/// # Example
///
/// ```rust
/// use taskkit::{task, Task, format_error_chain};
///
/// let t = task(|s: &'static str| s.parse::<u8>());
/// let err = t.run("300").unwrap_err();
/// let rendered = format_error_chain(&err);
///
/// assert!(rendered.starts_with("Error: task"));
/// assert!(rendered.contains("Caused by: number too large"));
/// ```
pub fn format_error_chain(error: &dyn StdError) -> String {
    let mut result = format!("Error: {}", error);
    let mut current = error.source();
    let mut level = 1;

    while let Some(source) = current {
        let _ = write!(result, "\n{:indent$}Caused by: {}", "", source, indent = level * 2);
        current = source.source();
        level += 1;
    }

    result
}

/// Get the root cause of an error chain
pub fn root_cause(error: &dyn StdError) -> &dyn StdError {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}

/// Count the number of errors in an error chain (minimum 1)
pub fn error_chain_length(error: &dyn StdError) -> usize {
    let mut count = 1;
    let mut current = error.source();

    while let Some(source) = current {
        count += 1;
        current = source.source();
    }

    count
}
