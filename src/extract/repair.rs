//! Text-level helpers for recovering JSON from model output.
//!
//! The scanners here are string-aware: brackets, commas and control characters
//! inside JSON string literals are never treated as structure.

use once_cell::sync::Lazy;
use regex::Regex;

static FENCE: Lazy<Regex> = Lazy::new(|| {
    // Opening fence with optional language tag; closing fence optional so a
    // truncated block still yields its body.
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)(?:```|\z)").expect("valid fence regex")
});
static GREEDY_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid object regex"));
static GREEDY_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("valid array regex"));

pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Body of the first markdown code fence, if any.
pub fn strip_fence(text: &str) -> Option<&str> {
    FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Candidate JSON substrings embedded in prose: the greedy `{...}` / `[...]`
/// match that starts first, then the first balanced block.
pub fn embedded_candidates(text: &str) -> Vec<&str> {
    let mut greedy: Vec<_> = [GREEDY_OBJECT.find(text), GREEDY_ARRAY.find(text)]
        .into_iter()
        .flatten()
        .collect();
    greedy.sort_by_key(|m| m.start());

    let mut out: Vec<&str> = greedy.iter().map(|m| m.as_str()).collect();
    if let Some(balanced) = first_balanced(text) {
        if !out.contains(&balanced) {
            out.push(balanced);
        }
    }
    out
}

/// First complete `{...}` or `[...]` block, matching brackets outside strings.
pub fn first_balanced(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede `}` or `]`.
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

/// Escape raw newlines, carriage returns and tabs inside the string values of
/// the named object fields. `"*"` selects every string value.
pub fn escape_long_text(text: &str, fields: &[String]) -> String {
    if fields.is_empty() {
        return text.to_string();
    }
    let all = fields.iter().any(|f| f == "*");

    // (is_object, last key seen in this object)
    let mut stack: Vec<(bool, Option<String>)> = Vec::new();
    let mut expect_key = false;
    let mut out = String::with_capacity(text.len() + 16);

    let mut in_string = false;
    let mut escaped = false;
    let mut is_key = false;
    let mut escape_this = false;
    let mut key_buf = String::new();

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                if is_key {
                    key_buf.push(c);
                }
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                    if is_key {
                        if let Some(top) = stack.last_mut() {
                            top.1 = Some(std::mem::take(&mut key_buf));
                        }
                    }
                }
                '\n' if escape_this => out.push_str("\\n"),
                '\r' if escape_this => out.push_str("\\r"),
                '\t' if escape_this => out.push_str("\\t"),
                _ => {
                    out.push(c);
                    if is_key {
                        key_buf.push(c);
                    }
                }
            }
            continue;
        }

        let in_object = matches!(stack.last(), Some((true, _)));
        match c {
            '{' => {
                stack.push((true, None));
                expect_key = true;
            }
            '[' => {
                stack.push((false, None));
                expect_key = false;
            }
            '}' | ']' => {
                stack.pop();
                expect_key = false;
            }
            ',' => expect_key = in_object,
            ':' => expect_key = false,
            '"' => {
                in_string = true;
                is_key = in_object && expect_key;
                key_buf.clear();
                escape_this = !is_key
                    && (all
                        || matches!(stack.last(), Some((true, Some(k)))
                            if fields.iter().any(|f| f == k)));
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Close a response that was cut off: terminate an open string, drop a
/// dangling comma, complete a dangling `key:` with `null`, and append the
/// missing closing brackets.
pub fn close_truncated(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    if stack.is_empty() && !in_string {
        return text.to_string();
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
