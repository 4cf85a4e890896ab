//! POSIX shell quoting.

use std::borrow::Cow;

/// Quote each argument for a POSIX shell and join them with spaces.
///
/// Arguments made only of characters the shell never interprets are left
/// bare; everything else is single-quoted.
#[must_use]
pub fn escape(args: &[&str]) -> String {
    args.iter()
        .map(|arg| shell_escape::unix::escape(Cow::Borrowed(*arg)))
        .collect::<Vec<_>>()
        .join(" ")
}
