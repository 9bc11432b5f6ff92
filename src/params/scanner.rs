/// Lexical context while walking a SQL template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backticked,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

pub(super) fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

/// Recognise `$tag$` (or `$$`) at `start`; returns the tag and the index of the closing `$`.
pub(super) fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') || b.is_ascii_digit() && idx == start + 1 {
            return None;
        }
        idx += 1;
    }

    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

pub(super) fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len()
        && bytes[idx + 1..end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Scan a `:name` parameter whose colon sits at `colon`.
///
/// Returns the end index (exclusive) of the name, or `None` if no identifier follows.
pub(super) fn scan_param_name(bytes: &[u8], colon: usize) -> Option<usize> {
    let start = colon + 1;
    if !bytes.get(start).copied().is_some_and(is_ident_start) {
        return None;
    }
    let mut idx = start + 1;
    while idx < bytes.len() && is_ident_continue(bytes[idx]) {
        idx += 1;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_quote_tags() {
        assert_eq!(try_start_dollar_quote(b"$$ body", 0), Some((String::new(), 1)));
        assert_eq!(
            try_start_dollar_quote(b"$fn$ body", 0),
            Some(("fn".to_string(), 3))
        );
        assert_eq!(try_start_dollar_quote(b"$1 + 2", 0), None);
        assert!(matches_tag(b"x $fn$ y", 2, "fn"));
    }

    #[test]
    fn param_names() {
        let sql = b"a = :user_id2, b";
        assert_eq!(scan_param_name(sql, 4), Some(13));
        assert_eq!(scan_param_name(b":1", 0), None);
        assert_eq!(scan_param_name(b":", 0), None);
    }
}
