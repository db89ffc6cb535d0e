#![forbid(unsafe_code)]

//! Header-safe filenames for `Content-Disposition`.
//!
//! Only the attachment header goes through here. Files on disk and the names
//! returned by the URL-reference endpoints keep the raw title.

/// Longest filename we hand back in a header.
pub const MAX_FILENAME_LEN: usize = 200;

/// Reduces `name` to printable ASCII that can sit inside a quoted header
/// parameter. Never fails; an input with nothing usable yields `""`.
pub fn sanitize(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .filter(|c| !matches!(c, '"' | '\\'))
        .map(|c| match c {
            '|' | '<' | '>' | ':' => '-',
            other => other,
        })
        .collect();

    // Only 0x20 survives the printable filter, so whitespace runs are spaces.
    let collapsed = filtered
        .split(' ')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut truncated = collapsed;
    truncated.truncate(MAX_FILENAME_LEN);
    // Truncation can land right after a space.
    let len = truncated.trim_end().len();
    truncated.truncate(len);
    truncated
}
