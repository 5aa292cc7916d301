//! Shared utility functions used across the codebase.

/// Parse a boolean setting value.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true` and
/// `0`, `false`, `no`, `n`, `off` as `false`; anything else is `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Return the value of `$HOME`, falling back to `/root`.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

/// Split a list-valued setting into trimmed, de-duplicated entries.
///
/// Accepts comma or whitespace separators and tolerates shell array syntax,
/// e.g. `("main" "agents")`. Order of first appearance is preserved.
pub fn split_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(trimmed);

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in inner.split(|c: char| c == ',' || c.is_whitespace()) {
        let item = strip_quotes(raw.trim());
        if item.is_empty() {
            continue;
        }
        if seen.insert(item.to_string()) {
            out.push(item.to_string());
        }
    }
    out
}

/// Split an ordered prefix list where entries may contain spaces.
///
/// Entries are separated by commas, or given as quoted words in shell array
/// syntax (`("git status" "ls")`).
pub fn split_prefix_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(trimmed);

    let mut out: Vec<String> = Vec::new();
    if inner.contains('"') || inner.contains('\'') {
        let mut current = String::new();
        let mut quote: Option<char> = None;
        for ch in inner.chars() {
            match quote {
                Some(q) if ch == q => {
                    quote = None;
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                Some(_) => current.push(ch),
                None if ch == '"' || ch == '\'' => quote = Some(ch),
                None => {}
            }
        }
    } else {
        out = inner
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    out.dedup();
    out
}

/// Remove one layer of matching single or double quotes.
pub fn strip_quotes(value: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner;
        }
    }
    value
}

/// Quote a value for safe interpolation into a POSIX shell script.
pub fn shell_escape(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let mut escaped = String::new();
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}
