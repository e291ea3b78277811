//! Golden text comparison

use similar::TextDiff;

/// Compare `actual` against `expected`. On mismatch, returns a unified
/// diff with `label` in the headers.
///
/// CRLF is normalized to LF on both sides first.
pub fn compare(expected: &str, actual: &str, label: &str) -> Result<(), String> {
    let expected = expected.replace("\r\n", "\n");
    let actual = actual.replace("\r\n", "\n");
    if expected == actual {
        return Ok(());
    }
    let diff = TextDiff::from_lines(&expected, &actual);
    let udiff = diff
        .unified_diff()
        .header(&format!("{} (expected)", label), &format!("{} (actual)", label))
        .to_string();
    Err(format!("{} differs from golden\n{}", label, udiff))
}
