//! Reader for the tagged-line markup protocol.
//!
//! Parsing never fails. Unknown inline tags are dropped, lines for features
//! a driver cannot print (barcodes, QR codes, raw escapes) are skipped, and
//! text outside any alignment tag is treated as left aligned.

use crate::markup::{unescape, Align, Column, MarkupLine, Span};

/// Line prefixes for content no driver here can print.
const UNSUPPORTED_LINE_TAGS: &[&str] = &["[BARCODE", "[QR", "[CODE", "[ESC", "[GS", "[FS", "[IMG"];

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse(markup: &str) -> Vec<MarkupLine> {
    markup.lines().filter_map(parse_line).collect()
}

fn parse_line(raw: &str) -> Option<MarkupLine> {
    let line = raw.trim_end_matches('\r');
    let trimmed = line.trim();

    if trimmed.eq_ignore_ascii_case("[CUT]") {
        return Some(MarkupLine::Cut);
    }
    if let Some(n) = parse_feed(trimmed) {
        return Some(MarkupLine::Feed(n));
    }
    let upper = trimmed.to_ascii_uppercase();
    if UNSUPPORTED_LINE_TAGS.iter().any(|t| upper.starts_with(t)) {
        return None;
    }

    let mut columns: Vec<Column> = Vec::new();
    let mut style = Span::default();
    let mut text = String::new();
    let mut rest = line;

    while !rest.is_empty() {
        if let Some(align) = alignment_prefix(rest) {
            flush(&mut columns, &mut text, &style);
            columns.push(Column {
                align,
                spans: Vec::new(),
            });
            rest = &rest[3..];
            continue;
        }
        if rest.starts_with('<') {
            if let Some(end) = rest.find('>') {
                let tag = rest[1..end].trim().to_ascii_lowercase();
                flush(&mut columns, &mut text, &style);
                apply_tag(&tag, &mut style);
                rest = &rest[end + 1..];
                continue;
            }
        }
        let Some(ch) = rest.chars().next() else {
            break;
        };
        text.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    flush(&mut columns, &mut text, &style);

    if columns.is_empty() {
        columns.push(Column {
            align: Align::Left,
            spans: Vec::new(),
        });
    }
    Some(MarkupLine::Row(columns))
}

fn parse_feed(trimmed: &str) -> Option<u8> {
    let upper = trimmed.to_ascii_uppercase();
    let inner = upper.strip_prefix("[FEED")?.strip_suffix(']')?;
    let inner = inner.trim();
    if inner.is_empty() {
        return Some(1);
    }
    inner.parse::<u8>().ok()
}

fn alignment_prefix(s: &str) -> Option<Align> {
    let b = s.as_bytes();
    if b.len() < 3 || b[0] != b'[' || b[2] != b']' {
        return None;
    }
    match b[1].to_ascii_uppercase() {
        b'L' => Some(Align::Left),
        b'C' => Some(Align::Center),
        b'R' => Some(Align::Right),
        _ => None,
    }
}

fn apply_tag(tag: &str, style: &mut Span) {
    match tag {
        "b" => style.bold = true,
        "/b" => style.bold = false,
        "u" => style.underline = true,
        "/u" => style.underline = false,
        "big" => style.big = true,
        "/big" | "/font" => style.big = false,
        t if t.starts_with("font") && t.contains("big") => style.big = true,
        _ => {}
    }
}

fn flush(columns: &mut Vec<Column>, text: &mut String, style: &Span) {
    if text.is_empty() {
        return;
    }
    if columns.is_empty() {
        columns.push(Column {
            align: Align::Left,
            spans: Vec::new(),
        });
    }
    let span = Span {
        text: unescape(text),
        bold: style.bold,
        underline: style.underline,
        big: style.big,
    };
    text.clear();
    if let Some(column) = columns.last_mut() {
        column.spans.push(span);
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Padding before each column of a row, for a paper `width` in characters.
///
/// A single column is placed by its alignment. Several columns are spread
/// across the line with at least one space between neighbours.
pub fn column_gaps(columns: &[Column], width: usize) -> Vec<usize> {
    match columns {
        [] => Vec::new(),
        [only] => {
            let free = width.saturating_sub(only.width());
            vec![match only.align {
                Align::Left => 0,
                Align::Center => free / 2,
                Align::Right => free,
            }]
        }
        _ => {
            let used: usize = columns.iter().map(Column::width).sum();
            let gaps = columns.len() - 1;
            let free = width.saturating_sub(used);
            let each = (free / gaps).max(1);
            let remainder = free.saturating_sub(each * gaps);
            let mut out = vec![0];
            for i in 0..gaps {
                out.push(if i + 1 == gaps { each + remainder } else { each });
            }
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Repair / plain text
// ---------------------------------------------------------------------------

/// Make loosely written markup well formed.
///
/// Blank input becomes a single empty left row; rows without an alignment
/// tag get `[L]`; unclosed style tags are closed at end of line and stray
/// closing tags are removed.
pub fn sanitize(markup: &str) -> String {
    if markup.trim().is_empty() {
        return "[L]\n".to_string();
    }
    let mut out = String::with_capacity(markup.len() + 16);
    for raw in markup.lines() {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            out.push_str("[L] \n");
            continue;
        }
        let is_command = trimmed.starts_with('[') && alignment_prefix(trimmed).is_none();
        if is_command {
            out.push_str(trimmed);
            out.push('\n');
            continue;
        }
        if alignment_prefix(line).is_none() {
            out.push_str("[L]");
        }
        out.push_str(&balance_tags(line));
        out.push('\n');
    }
    out
}

fn balance_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut open: Vec<&'static str> = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        let Some(end) = after.find('>') else {
            out.push_str(after);
            rest = "";
            break;
        };
        let tag = after[1..end].trim().to_ascii_lowercase();
        match tag.as_str() {
            "b" | "u" | "big" => {
                let name = match tag.as_str() {
                    "b" => "b",
                    "u" => "u",
                    _ => "big",
                };
                open.push(name);
                out.push_str(&after[..=end]);
            }
            "/b" | "/u" | "/big" => {
                let name = &tag[1..];
                if let Some(pos) = open.iter().rposition(|t| *t == name) {
                    open.remove(pos);
                    out.push_str(&after[..=end]);
                }
            }
            _ => out.push_str(&after[..=end]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    while let Some(tag) = open.pop() {
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
    out
}

/// Render markup as readable text for drivers that cannot interpret tags.
///
/// Command and unsupported lines are dropped, columns are laid out to
/// `width`, line ends are trimmed and runs of blank lines collapse to one.
/// Never returns an empty string.
pub fn to_plain_text(markup: &str, width: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in parse(markup) {
        let MarkupLine::Row(columns) = line else {
            continue;
        };
        let gaps = column_gaps(&columns, width);
        let mut text = String::new();
        for (column, gap) in columns.iter().zip(gaps) {
            text.push_str(&" ".repeat(gap));
            text.push_str(&column.text());
        }
        lines.push(text.trim_end().to_string());
    }

    let mut out = String::new();
    let mut blank_run = 0;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&line);
        out.push('\n');
    }

    if out.trim().is_empty() {
        " ".to_string()
    } else {
        out
    }
}
