//! Text normalization shared by the loader and the query path.

/// Normalize extracted document text.
///
/// - Removes carriage returns and NUL bytes.
/// - Collapses runs of spaces and tabs into one space.
/// - Strips trailing whitespace on each line.
/// - Collapses three or more consecutive newlines into a single blank line.
/// - Trims the result.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    let mut newlines = 0usize;

    for c in raw.chars() {
        match c {
            '\r' | '\0' => {}
            '\n' => {
                pending_space = false;
                newlines += 1;
            }
            c if c.is_whitespace() => {
                pending_space = true;
            }
            c => {
                if newlines > 0 {
                    if !out.is_empty() {
                        let breaks = newlines.min(2);
                        for _ in 0..breaks {
                            out.push('\n');
                        }
                    }
                    newlines = 0;
                    pending_space = false;
                } else if pending_space {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    pending_space = false;
                }
                out.push(c);
            }
        }
    }

    out
}

/// Normalize a user query: straighten curly quotes, drop control
/// characters, collapse all whitespace to single spaces, and trim.
pub fn normalize_query(raw: &str) -> String {
    let straightened = straighten_quotes(raw);
    let mut out = String::with_capacity(straightened.len());
    for word in straightened
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|w| !w.is_empty())
    {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Replace typographic quotes with their ASCII equivalents.
pub fn straighten_quotes(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            other => other,
        })
        .collect()
}

/// Largest byte index `<= idx` that falls on a char boundary.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
