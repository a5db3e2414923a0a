//! Input hygiene helpers: log-safe text, SQL-special escaping and file names.
//!
//! `escape_sql` is a second layer only. Queries still bind parameters.

const LOG_MAX_CHARS: usize = 200;
const FILENAME_MAX_BYTES: usize = 255;
const UNSAFE_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Single-line, truncated, with control characters escaped.
pub fn for_log(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(LOG_MAX_CHARS + 3));
    for (i, c) in input.chars().enumerate() {
        if i == LOG_MAX_CHARS {
            out.push_str("...");
            break;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push('?'),
            c => out.push(c),
        }
    }
    out
}

pub fn escape_sql(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => out.push_str("''"),
            '"' => out.push_str("\"\""),
            '\\' => out.push_str("\\\\"),
            '\0' | ';' => {}
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                out.push('-');
            }
            c => out.push(c),
        }
    }
    out
}

pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.len() > FILENAME_MAX_BYTES || name == "." || name.contains("..") {
        return false;
    }
    if name.chars().any(|c| c.is_control() || UNSAFE_FILENAME_CHARS.contains(&c)) {
        return false;
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return false;
    }
    !is_reserved(name)
}

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem))
}

/// Replace unsafe characters with `_` so the result passes
/// [`is_safe_filename`].
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_control() || UNSAFE_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    let trimmed = out.trim_end_matches(&['.', ' '][..]).trim_start();
    let mut out = if trimmed.is_empty() || trimmed == "." {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    };
    if is_reserved(&out) {
        out.insert(0, '_');
    }
    if out.len() > FILENAME_MAX_BYTES {
        let mut cut = FILENAME_MAX_BYTES;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        let end = out.trim_end_matches(&['.', ' '][..]).len();
        out.truncate(end);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_text_is_single_line_and_bounded() {
        assert_eq!(for_log("ana\nadmin=1"), "ana\\nadmin=1");
        let long = "x".repeat(500);
        let logged = for_log(&long);
        assert!(logged.ends_with("..."));
        assert_eq!(logged.chars().count(), LOG_MAX_CHARS + 3);
    }

    #[test]
    fn sql_specials_are_neutralised() {
        assert_eq!(escape_sql("O'Brien"), "O''Brien");
        assert_eq!(escape_sql("1; DROP TABLE x -- y"), "1 DROP TABLE x - y");
        assert_eq!(escape_sql("a\\b"), "a\\\\b");
    }

    #[test]
    fn filename_predicate() {
        assert!(is_safe_filename("Proyecto Norte 2024.xlsx"));
        assert!(!is_safe_filename("../etc/passwd"));
        assert!(!is_safe_filename("a/b.xlsx"));
        assert!(!is_safe_filename("CON.xlsx"));
        assert!(!is_safe_filename("trailing."));
        assert!(!is_safe_filename(""));
    }

    #[test]
    fn sanitized_names_are_safe() {
        for raw in ["a<b>c:d.xlsx", "../../x", "CON", "   ", "name. ", "ok.xlsx"] {
            let clean = sanitize_filename(raw);
            assert!(is_safe_filename(&clean), "{raw:?} -> {clean:?}");
        }
        assert_eq!(sanitize_filename("ok.xlsx"), "ok.xlsx");
    }
}
