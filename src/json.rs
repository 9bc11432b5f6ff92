//! Result-set serialisation to a JSON array of row objects.

use std::fmt::Write as _;

use crate::error::DbQueueError;
use crate::types::CellValue;

/// Slack added when doubling the capacity is not enough for a single write.
const EXACT_FIT_SLACK: usize = 1024;

/// Append-only JSON output buffer with explicit, fallible growth.
///
/// Growth doubles the capacity, or jumps to `len + needed + 1024` when doubling is still too
/// small. Every growth step goes through [`JsonBuffer::ensure_capacity`], which either
/// reserves the space or fails with [`DbQueueError::AllocationError`] leaving the written
/// content untouched.
#[derive(Debug, Default)]
pub struct JsonBuffer {
    buf: String,
    limit: Option<usize>,
}

impl JsonBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that refuses to grow its capacity beyond `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Capacity the buffer would grow to for `needed` more bytes, or `None` if it fits.
    #[must_use]
    pub fn next_capacity(&self, needed: usize) -> Option<usize> {
        next_capacity(self.buf.len(), self.buf.capacity(), needed)
    }

    /// Make room for `needed` more bytes.
    ///
    /// # Errors
    /// Returns [`DbQueueError::AllocationError`] if the target capacity overflows, exceeds the
    /// configured limit, or cannot be reserved. The buffer is unchanged in that case.
    pub fn ensure_capacity(&mut self, needed: usize) -> Result<(), DbQueueError> {
        let Some(target) = self.next_capacity(needed) else {
            return Ok(());
        };
        if let Some(limit) = self.limit
            && target > limit
        {
            return Err(DbQueueError::AllocationError(format!(
                "JSON buffer growth to {target} bytes exceeds limit of {limit}"
            )));
        }
        let additional = target - self.buf.len();
        self.buf.try_reserve_exact(additional).map_err(|e| {
            DbQueueError::AllocationError(format!("JSON buffer growth to {target} bytes: {e}"))
        })
    }

    /// Append raw text, growing first.
    ///
    /// # Errors
    /// Propagates [`JsonBuffer::ensure_capacity`] failures.
    pub fn push_str(&mut self, s: &str) -> Result<(), DbQueueError> {
        self.ensure_capacity(s.len())?;
        self.buf.push_str(s);
        Ok(())
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.buf
    }
}

fn next_capacity(len: usize, capacity: usize, needed: usize) -> Option<usize> {
    let required = len.saturating_add(needed);
    if required <= capacity {
        return None;
    }
    let doubled = capacity.saturating_mul(2);
    if doubled >= required {
        Some(doubled)
    } else {
        Some(required.saturating_add(EXACT_FIT_SLACK))
    }
}

/// Escape `s` as the body of a JSON string (without surrounding quotes).
#[must_use]
pub fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Permissive number check: optional sign, digits, at most one decimal point, optional
/// exponent. At least one digit is required before any exponent.
#[must_use]
pub fn is_numeric_literal(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut idx = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        idx += 1;
    }

    let mut digits = 0;
    let mut seen_dot = false;
    while idx < bytes.len() {
        match bytes[idx] {
            b'0'..=b'9' => digits += 1,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        idx += 1;
    }
    if digits == 0 {
        return false;
    }

    if idx < bytes.len() && matches!(bytes[idx], b'e' | b'E') {
        idx += 1;
        if matches!(bytes.get(idx), Some(b'+' | b'-')) {
            idx += 1;
        }
        let exp_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == exp_start {
            return false;
        }
    }
    idx == bytes.len()
}

/// Rewrite a permissive numeric literal into strict JSON number syntax.
fn normalize_number(s: &str) -> String {
    let (negative, unsigned) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], Some(&unsigned[pos + 1..])),
        None => (unsigned, None),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let int_part = int_part.trim_start_matches('0');

    let mut out = String::with_capacity(s.len() + 2);
    if negative {
        out.push('-');
    }
    out.push_str(if int_part.is_empty() { "0" } else { int_part });
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    if let Some(exp) = exponent {
        out.push('e');
        out.push_str(exp);
    }
    out
}

fn format_text(s: &str) -> String {
    if is_numeric_literal(s) {
        normalize_number(s)
    } else {
        format!("\"{}\"", escape_json_string(s))
    }
}

/// Render one cell as a JSON value.
#[must_use]
pub fn format_cell(value: &CellValue) -> String {
    match value {
        CellValue::Null => "null".to_string(),
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) if f.is_finite() => f.to_string(),
        CellValue::Float(f) => format!("\"{f}\""),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Text(s) => format_text(s),
        CellValue::Timestamp(ts) => format!("\"{}\"", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        CellValue::JSON(v) => v.to_string(),
        CellValue::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 2);
            hex.push('"');
            for b in bytes {
                let _ = write!(hex, "{b:02x}");
            }
            hex.push('"');
            hex
        }
    }
}

/// Serialise rows into `[{"col":value,...},...]` through a growth-checked buffer.
///
/// # Errors
/// Returns [`DbQueueError::AllocationError`] if the buffer cannot grow.
pub fn write_rows(
    buffer: &mut JsonBuffer,
    columns: &[String],
    rows: &[Vec<CellValue>],
) -> Result<(), DbQueueError> {
    let keys: Vec<String> = columns
        .iter()
        .map(|c| format!("\"{}\":", escape_json_string(c)))
        .collect();

    buffer.push_str("[")?;
    for (row_idx, row) in rows.iter().enumerate() {
        if row_idx > 0 {
            buffer.push_str(",")?;
        }
        buffer.push_str("{")?;
        for (col_idx, key) in keys.iter().enumerate() {
            if col_idx > 0 {
                buffer.push_str(",")?;
            }
            buffer.push_str(key)?;
            let cell = row.get(col_idx).map_or_else(|| "null".to_string(), format_cell);
            buffer.push_str(&cell)?;
        }
        buffer.push_str("}")?;
    }
    buffer.push_str("]")
}

/// Convenience wrapper around [`write_rows`] with an unbounded buffer.
///
/// # Errors
/// Returns [`DbQueueError::AllocationError`] if the buffer cannot grow.
pub fn rows_to_json(columns: &[String], rows: &[Vec<CellValue>]) -> Result<String, DbQueueError> {
    let mut buffer = JsonBuffer::new();
    write_rows(&mut buffer, columns, rows)?;
    Ok(buffer.into_string())
}
