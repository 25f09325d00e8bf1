//! ESC/POS binary command builder for thermal receipt printers.
//!
//! Generates the raw byte stream written to a printer over TCP 9100 or a
//! Bluetooth SPP serial link. Covers text styling, alignment, feed/cut and
//! the real-time status requests used by health probes.

use crate::markup::Align;

// ESC/POS command bytes
const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
const DLE: u8 = 0x10;
const EOT: u8 = 0x04;
const LF: u8 = 0x0A;

/// Paper width in characters (Font A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperWidth {
    Mm58,
    Mm80,
}

impl PaperWidth {
    pub fn chars(self) -> usize {
        match self {
            PaperWidth::Mm58 => 32,
            PaperWidth::Mm80 => 48,
        }
    }

    pub fn from_mm(mm: u32) -> Self {
        if mm <= 58 {
            PaperWidth::Mm58
        } else {
            PaperWidth::Mm80
        }
    }
}

/// Real-time status classes for `DLE EOT n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequest {
    Printer = 1,
    Offline = 2,
    Error = 3,
    PaperSensor = 4,
}

/// Builder for ESC/POS command buffers.
///
/// ```rust,ignore
/// let mut b = EscPosBuilder::new(PaperWidth::Mm58);
/// b.init().align(Align::Center).bold(true).text("RECEIPT").bold(false).lf();
/// b.feed(3).cut();
/// let bytes = b.build();
/// ```
pub struct EscPosBuilder {
    buffer: Vec<u8>,
    paper: PaperWidth,
}

impl EscPosBuilder {
    pub fn new(paper: PaperWidth) -> Self {
        Self {
            buffer: Vec::with_capacity(512),
            paper,
        }
    }

    pub fn paper(&self) -> PaperWidth {
        self.paper
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// ESC @ — Initialize printer, reset to defaults.
    pub fn init(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x40]);
        self
    }

    // -----------------------------------------------------------------------
    // Text formatting
    // -----------------------------------------------------------------------

    /// ESC E n — Bold on/off.
    pub fn bold(&mut self, on: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, u8::from(on)]);
        self
    }

    /// ESC - n — Underline (thin) on/off.
    pub fn underline(&mut self, on: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x2D, u8::from(on)]);
        self
    }

    /// GS ! n — Character size, width and height multipliers 1–8.
    pub fn text_size(&mut self, width: u8, height: u8) -> &mut Self {
        let w = width.clamp(1, 8) - 1;
        let h = height.clamp(1, 8) - 1;
        self.buffer.extend_from_slice(&[GS, 0x21, (w << 4) | h]);
        self
    }

    pub fn double_size(&mut self, on: bool) -> &mut Self {
        if on {
            self.text_size(2, 2)
        } else {
            self.text_size(1, 1)
        }
    }

    /// ESC a n — Justification.
    pub fn align(&mut self, align: Align) -> &mut Self {
        let n = match align {
            Align::Left => 0,
            Align::Center => 1,
            Align::Right => 2,
        };
        self.buffer.extend_from_slice(&[ESC, 0x61, n]);
        self
    }

    // -----------------------------------------------------------------------
    // Text output
    // -----------------------------------------------------------------------

    /// Append text. Non-ASCII characters become `?`; control characters
    /// other than LF are dropped so user text cannot inject commands.
    pub fn text(&mut self, s: &str) -> &mut Self {
        for ch in s.chars() {
            match ch {
                '\n' => self.buffer.push(LF),
                c if c.is_ascii_control() => {}
                c if c.is_ascii() => self.buffer.push(c as u8),
                _ => self.buffer.push(b'?'),
            }
        }
        self
    }

    pub fn spaces(&mut self, n: usize) -> &mut Self {
        self.buffer.extend(std::iter::repeat(b' ').take(n));
        self
    }

    pub fn lf(&mut self) -> &mut Self {
        self.buffer.push(LF);
        self
    }

    // -----------------------------------------------------------------------
    // Feed / cut
    // -----------------------------------------------------------------------

    /// ESC d n — Feed n lines.
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x64, lines]);
        self
    }

    /// GS V A 16 — Partial cut with 16-dot feed.
    pub fn cut(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x56, 0x41, 0x10]);
        self
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// DLE EOT n — Real-time status transmission.
    pub fn status_request(&mut self, kind: StatusRequest) -> &mut Self {
        self.buffer.extend_from_slice(&[DLE, EOT, kind as u8]);
        self
    }

    /// Consume the builder and return the binary payload.
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Status byte decoding
// ---------------------------------------------------------------------------

/// Paper sensor status (`DLE EOT 4`): bits 5 and 6 flag paper end.
pub fn paper_end(status: u8) -> bool {
    status & 0x60 != 0
}

/// Error status (`DLE EOT 3`): bit 6 is an auto-recoverable error, which
/// on thermal heads means the print head overheated.
pub fn auto_recoverable_error(status: u8) -> bool {
    status & 0x40 != 0
}
