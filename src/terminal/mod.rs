pub mod surface;

use crate::protocol::TermSize;

pub use surface::{Cell, Color, Notice, TerminalSurface};

/// Cell width in tenths of the font size, for a typical monospace face.
const CELL_WIDTH_TENTHS: u64 = 6;
/// Line height in tenths of the font size.
const CELL_HEIGHT_TENTHS: u64 = 12;

/// Pixel area a terminal is drawn into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width_px: u32,
    pub height_px: u32,
}

impl Viewport {
    pub const fn new(width_px: u32, height_px: u32) -> Self {
        Self {
            width_px,
            height_px,
        }
    }

    /// Columns and rows that fit at `font_size_px`. Never below 2x1.
    pub fn fit(&self, font_size_px: u16) -> TermSize {
        let font = u64::from(font_size_px.max(1));
        let cols = u64::from(self.width_px) * 10 / (font * CELL_WIDTH_TENTHS);
        let rows = u64::from(self.height_px) * 10 / (font * CELL_HEIGHT_TENTHS);
        TermSize::new(
            cols.clamp(2, u64::from(u16::MAX)) as u16,
            rows.clamp(1, u64::from(u16::MAX)) as u16,
        )
    }
}

/// Rendering settings. Changing them rebuilds the terminal from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayPreferences {
    pub font_family: String,
    pub font_size_px: u16,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            font_family: "Menlo, Monaco, \"Courier New\", monospace".to_string(),
            font_size_px: 14,
        }
    }
}
