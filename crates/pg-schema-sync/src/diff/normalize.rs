//! SQL text canonicalization for DDL comparison.
//!
//! Two statements that differ only in comments, keyword case, whitespace or
//! spacing around punctuation normalize to the same string. Quoted literals,
//! quoted identifiers and dollar-quoted bodies are copied byte for byte.

/// Characters that never need surrounding whitespace.
const TIGHT_PUNCTUATION: &[char] = &['(', ')', ',', ';', '=', '<', '>', '+', '*', '/', '|', ':'];

/// Canonical form of `sql` for equality checks.
pub fn normalize_sql(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // -- line comment
        if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            pending_space = true;
            continue;
        }

        // /* block comment */, nesting allowed
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let mut depth = 0usize;
            while i < chars.len() {
                if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                    depth += 1;
                    i += 2;
                } else if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            pending_space = true;
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        if TIGHT_PUNCTUATION.contains(&c) {
            while out.ends_with(' ') {
                out.pop();
            }
            out.push(c);
            pending_space = false;
            i += 1;
            // Swallow whitespace that follows.
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            continue;
        }

        if pending_space && !out.is_empty() && !out.ends_with(TIGHT_PUNCTUATION) {
            out.push(' ');
        }
        pending_space = false;

        match c {
            '\'' | '"' => {
                i = copy_quoted(&chars, i, c, &mut out);
            }
            '$' => {
                if let Some(end) = dollar_quoted_end(&chars, i) {
                    out.extend(&chars[i..end]);
                    i = end;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.extend(c.to_lowercase());
                i += 1;
            }
        }
    }

    let mut result = out.trim().to_string();
    while result.ends_with(';') {
        result.pop();
        result.truncate(result.trim_end().len());
    }
    result
}

/// Copy a quoted token starting at `start` verbatim, including doubled
/// quote escapes. Returns the index after the closing quote.
fn copy_quoted(chars: &[char], start: usize, quote: char, out: &mut String) -> usize {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        out.push(chars[i]);
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

/// If a dollar-quote delimiter (`$$` or `$tag$`) starts at `start`, return
/// the index of its closing `$`.
pub(crate) fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '$' {
            return Some(i);
        }
        let valid = if i == start + 1 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        i += 1;
    }
    None
}

/// If a dollar-quoted string opens at `start`, return the index just past
/// its closing delimiter (the end of input when unterminated).
pub(crate) fn dollar_quoted_end(chars: &[char], start: usize) -> Option<usize> {
    let tag_end = dollar_tag_end(chars, start)?;
    let tag = &chars[start..=tag_end];
    let mut i = tag_end + 1;
    while i < chars.len() {
        if chars[i..].starts_with(tag) {
            return Some(i + tag.len());
        }
        i += 1;
    }
    Some(chars.len())
}
