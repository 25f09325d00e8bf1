//! Tagged-line intermediate representation for printable documents.
//!
//! The renderer builds a [`Markup`] document from typed rows and serialises
//! it to the text protocol below. Only the driver layer reads the text back
//! (see `drivers::tags`).
//!
//! ```text
//! [C]<b>Corner Bistro</b>
//! [L]<b>Order #:</b> 1042
//! [L]Flat white[R]2 x $3.50
//! [FEED 4]
//! [CUT]
//! ```
//!
//! A row is one or more columns, each opened by `[L]`, `[C]` or `[R]`.
//! Inline spans use `<b>`, `<u>` and `<big>`. `&`, `<` and `[` inside text
//! are escaped as `&amp;`, `&lt;` and `&#91;`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Align {
    Left,
    Center,
    Right,
}

impl Align {
    pub fn tag(self) -> &'static str {
        match self {
            Align::Left => "[L]",
            Align::Center => "[C]",
            Align::Right => "[R]",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub bold: bool,
    pub underline: bool,
    pub big: bool,
}

impl Span {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn bold(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: true,
            ..Default::default()
        }
    }

    /// Printed width in character cells.
    pub fn width(&self) -> usize {
        let n = self.text.chars().count();
        if self.big {
            n * 2
        } else {
            n
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub align: Align,
    pub spans: Vec<Span>,
}

impl Column {
    pub fn width(&self) -> usize {
        self.spans.iter().map(Span::width).sum()
    }

    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupLine {
    Row(Vec<Column>),
    Feed(u8),
    Cut,
}

/// An ordered list of printable lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markup {
    lines: Vec<MarkupLine>,
}

impl Markup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[MarkupLine] {
        &self.lines
    }

    pub fn push(&mut self, line: MarkupLine) -> &mut Self {
        self.lines.push(line);
        self
    }

    pub fn row(&mut self, align: Align, spans: Vec<Span>) -> &mut Self {
        self.push(MarkupLine::Row(vec![Column { align, spans }]))
    }

    pub fn text(&mut self, align: Align, text: impl Into<String>) -> &mut Self {
        self.row(align, vec![Span::plain(text)])
    }

    /// `label` in bold followed by a plain value on the same column.
    pub fn labeled(&mut self, label: &str, value: impl Into<String>) -> &mut Self {
        self.row(
            Align::Left,
            vec![Span::bold(label), Span::plain(format!(" {}", value.into()))],
        )
    }

    /// Left and right column on one row.
    pub fn pair(&mut self, left: Vec<Span>, right: Vec<Span>) -> &mut Self {
        self.push(MarkupLine::Row(vec![
            Column {
                align: Align::Left,
                spans: left,
            },
            Column {
                align: Align::Right,
                spans: right,
            },
        ]))
    }

    pub fn separator(&mut self, width: usize) -> &mut Self {
        self.text(Align::Center, "-".repeat(width))
    }

    pub fn blank(&mut self) -> &mut Self {
        self.row(Align::Left, Vec::new())
    }

    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.push(MarkupLine::Feed(lines))
    }

    pub fn cut(&mut self) -> &mut Self {
        self.push(MarkupLine::Cut)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for MarkupLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkupLine::Feed(n) => write!(f, "[FEED {n}]"),
            MarkupLine::Cut => f.write_str("[CUT]"),
            MarkupLine::Row(columns) => {
                for column in columns {
                    f.write_str(column.align.tag())?;
                    for span in &column.spans {
                        write_span(f, span)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Markup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

const OPEN_TAGS: [&str; 3] = ["<b>", "<u>", "<big>"];
const CLOSE_TAGS: [&str; 3] = ["</big>", "</u>", "</b>"];

fn write_span(f: &mut fmt::Formatter<'_>, span: &Span) -> fmt::Result {
    if span.text.is_empty() {
        return Ok(());
    }
    let flags = [span.bold, span.underline, span.big];
    for (tag, on) in OPEN_TAGS.iter().zip(flags) {
        if on {
            f.write_str(tag)?;
        }
    }
    f.write_str(&escape(&span.text))?;
    for (tag, on) in CLOSE_TAGS.iter().zip(flags.iter().rev()) {
        if *on {
            f.write_str(tag)?;
        }
    }
    Ok(())
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '[' => out.push_str("&#91;"),
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&#91;", "[")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
