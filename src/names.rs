//! Qualified action-name parsing and normalization.
//!
//! Every action reference in a composition is stored fully qualified:
//! `/namespace[/package]/action`. User-facing constructors accept the short
//! forms and qualify them here, defaulting the namespace to `_`.

use miette::Diagnostic;
use thiserror::Error;

/// Errors produced while normalizing an action name.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum NameError {
    /// The name was empty (or all whitespace).
    #[error("Name is not specified")]
    #[diagnostic(code(baton::names::not_specified))]
    NotSpecified,

    /// The name does not match any accepted qualification pattern.
    #[error("Name is not valid")]
    #[diagnostic(
        code(baton::names::not_valid),
        help("Accepted forms: `action`, `package/action`, `/namespace/action`, `/namespace/package/action`.")
    )]
    NotValid,
}

/// Parse a (possibly fully qualified) action name and normalize it.
///
/// Qualification rules:
///
/// | input | output |
/// |---|---|
/// | `foo` | `/_/foo` |
/// | `pkg/foo` | `/_/pkg/foo` |
/// | `ns/pkg/foo` | `/ns/pkg/foo` |
/// | `/ns/foo` | `/ns/foo` |
/// | `/ns/pkg/foo` | `/ns/pkg/foo` |
///
/// Anything else is rejected: more than four segments, a leading slash with a
/// single segment after it, or any empty segment after the leading slash.
/// The function is idempotent on its own output.
///
/// # Examples
///
/// ```
/// use baton::names::parse_action_name;
///
/// assert_eq!(parse_action_name("foo").unwrap(), "/_/foo");
/// assert_eq!(parse_action_name("/ns/pkg/foo").unwrap(), "/ns/pkg/foo");
/// assert!(parse_action_name("/foo").is_err());
/// ```
pub fn parse_action_name(name: &str) -> Result<String, NameError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NameError::NotSpecified);
    }

    let parts: Vec<&str> = name.split('/').collect();
    let n = parts.len();
    let leading_slash = name.starts_with('/');

    // No more than /ns/pkg/action.
    if n > 4 || (leading_slash && n == 2) || (!leading_slash && n == 4) {
        return Err(NameError::NotValid);
    }

    // Skip the segment before the leading slash; everything else must be
    // non-empty after trimming.
    if parts.iter().skip(1).any(|part| part.trim().is_empty()) {
        return Err(NameError::NotValid);
    }

    if leading_slash {
        Ok(name.to_owned())
    } else if n < 3 {
        Ok(format!("/_/{name}"))
    } else {
        Ok(format!("/{name}"))
    }
}
