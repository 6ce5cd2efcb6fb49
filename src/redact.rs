/// Credential scrubbing for log lines that leave the host inside an alert.
///
/// Masks values in `key=value` / `key: value` pairs whose key looks like a
/// secret (password, token, api key, secret) and bearer tokens.
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key)(\s*[=:]\s*)[^\s&,;]+")
                .unwrap(),
            "${1}${2}REDACTED",
        ),
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]+=*").unwrap(),
            "Bearer REDACTED",
        ),
    ]
});

/// Return `line` with any secrets masked. Borrows when nothing matched.
pub fn redact(line: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(line);
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        if pattern.is_match(&out) {
            out = Cow::Owned(pattern.replace_all(&out, *replacement).into_owned());
        }
    }
    out
}
