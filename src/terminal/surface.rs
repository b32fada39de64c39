use crate::protocol::TermSize;
use std::collections::VecDeque;
use vte::{Params, Parser, Perform};

/// Lines kept above the visible screen.
const SCROLLBACK_LIMIT: usize = 1000;
/// Raw shell bytes kept for inspection.
const OUTPUT_LOG_LIMIT: usize = 256 * 1024;

/// A single cell in the terminal grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub underline: bool,
}

/// Terminal color representation.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Color {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: Color::Default,
            bg: Color::Default,
            bold: false,
            underline: false,
        }
    }
}

/// Kind of locally generated line written between shell output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Info,
    Success,
    Warning,
    Error,
}

impl Notice {
    fn sgr(self) -> &'static str {
        match self {
            Self::Info => "\x1b[36m",
            Self::Success => "\x1b[32m",
            Self::Warning => "\x1b[33m",
            Self::Error => "\x1b[1;31m",
        }
    }
}

/// The screen a terminal adapter renders into: a vte-driven cell grid with
/// scrollback.
pub struct TerminalSurface {
    parser: Parser,
    grid: Grid,
    output: VecDeque<u8>,
}

impl TerminalSurface {
    pub fn new(size: TermSize) -> Self {
        Self {
            parser: Parser::new(),
            grid: Grid::new(size),
            output: VecDeque::new(),
        }
    }

    /// Feed shell output, exactly as received, into the VT parser.
    pub fn process(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
        if self.output.len() > OUTPUT_LOG_LIMIT {
            let excess = self.output.len() - OUTPUT_LOG_LIMIT;
            self.output.drain(..excess);
        }
        self.parser.advance(&mut self.grid, bytes);
    }

    /// Write a local status line. Starts on a fresh line and leaves the pen
    /// attributes as they were.
    pub fn write_notice(&mut self, notice: Notice, text: &str) {
        let mut bytes = Vec::with_capacity(text.len() + 16);
        if self.grid.cursor_x > 0 {
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(notice.sgr().as_bytes());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(b"\x1b[0m\r\n");
        let pen = self.grid.pen.clone();
        self.parser.advance(&mut self.grid, &bytes);
        self.grid.pen = pen;
    }

    /// Blank the screen and drop scrollback, as before a reconnect.
    pub fn clear(&mut self) {
        let size = self.size();
        self.parser = Parser::new();
        self.grid = Grid::new(size);
        self.output.clear();
    }

    pub fn resize(&mut self, size: TermSize) {
        self.grid.resize(size);
    }

    pub fn size(&self) -> TermSize {
        TermSize::new(self.grid.cols as u16, self.grid.rows as u16)
    }

    /// Cursor as `(col, row)`, zero based.
    pub fn cursor(&self) -> (usize, usize) {
        (self.grid.cursor_x, self.grid.cursor_y)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.grid.cells.get(row).and_then(|r| r.get(col))
    }

    /// Text of one visible row, without trailing blanks.
    pub fn line(&self, row: usize) -> String {
        self.grid.line_text(row)
    }

    /// Visible screen text; trailing blank rows are dropped.
    pub fn screen_text(&self) -> String {
        let mut lines: Vec<String> = (0..self.grid.rows).map(|r| self.line(r)).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    pub fn scrollback(&self) -> impl Iterator<Item = &str> {
        self.grid.scrollback.iter().map(String::as_str)
    }

    /// Scrollback followed by the visible screen.
    pub fn text(&self) -> String {
        let screen = self.screen_text();
        let mut all: Vec<&str> = self.scrollback().collect();
        all.push(&screen);
        all.join("\n")
    }

    /// Shell output bytes received since the last clear, most recent last.
    pub fn output_log(&self) -> Vec<u8> {
        self.output.iter().copied().collect()
    }
}

struct Grid {
    cursor_x: usize,
    cursor_y: usize,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<Cell>>,
    scrollback: VecDeque<String>,
    /// Attributes applied to newly printed cells.
    pen: Cell,
}

impl Grid {
    fn new(size: TermSize) -> Self {
        let cols = usize::from(size.cols.max(2));
        let rows = usize::from(size.rows.max(1));
        Self {
            cursor_x: 0,
            cursor_y: 0,
            cols,
            rows,
            cells: vec![vec![Cell::default(); cols]; rows],
            scrollback: VecDeque::new(),
            pen: Cell::default(),
        }
    }

    fn resize(&mut self, size: TermSize) {
        let cols = usize::from(size.cols.max(2));
        let rows = usize::from(size.rows.max(1));
        // Shrinking keeps the rows nearest the cursor.
        while self.cells.len() > rows {
            if self.cursor_y + 1 < self.cells.len() {
                self.cells.pop();
            } else {
                let top = self.line_text(0);
                self.cells.remove(0);
                self.push_scrollback(top);
                self.cursor_y -= 1;
            }
        }
        self.cols = cols;
        self.rows = rows;
        self.cells.resize(rows, vec![Cell::default(); cols]);
        for row in self.cells.iter_mut() {
            row.resize(cols, Cell::default());
        }
        self.cursor_x = self.cursor_x.min(cols - 1);
        self.cursor_y = self.cursor_y.min(rows - 1);
    }

    fn line_text(&self, row: usize) -> String {
        self.cells
            .get(row)
            .map(|r| r.iter().map(|c| c.ch).collect::<String>())
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default()
    }

    fn blank(&self) -> Cell {
        Cell {
            bg: self.pen.bg,
            ..Cell::default()
        }
    }

    fn scroll_up(&mut self) {
        let top = self.line_text(0);
        self.cells.remove(0);
        self.cells.push(vec![self.blank(); self.cols]);
        self.push_scrollback(top);
    }

    fn push_scrollback(&mut self, line: String) {
        self.scrollback.push_back(line);
        if self.scrollback.len() > SCROLLBACK_LIMIT {
            self.scrollback.pop_front();
        }
    }

    fn line_feed(&mut self) {
        if self.cursor_y + 1 >= self.rows {
            self.scroll_up();
        } else {
            self.cursor_y += 1;
        }
    }

    fn erase(&mut self, row: usize, cols: impl Iterator<Item = usize>) {
        let blank = self.blank();
        if let Some(line) = self.cells.get_mut(row) {
            for x in cols {
                if let Some(cell) = line.get_mut(x) {
                    *cell = blank.clone();
                }
            }
        }
    }

    fn select_graphic_rendition(&mut self, params: &Params) {
        let values: Vec<u16> = params.iter().flat_map(|p| p.iter().copied()).collect();
        if values.is_empty() {
            self.pen = Cell::default();
            return;
        }
        let mut i = 0;
        while i < values.len() {
            match values[i] {
                0 => self.pen = Cell::default(),
                1 => self.pen.bold = true,
                4 => self.pen.underline = true,
                22 => self.pen.bold = false,
                24 => self.pen.underline = false,
                n @ 30..=37 => self.pen.fg = Color::Indexed((n - 30) as u8),
                39 => self.pen.fg = Color::Default,
                n @ 40..=47 => self.pen.bg = Color::Indexed((n - 40) as u8),
                49 => self.pen.bg = Color::Default,
                n @ 90..=97 => self.pen.fg = Color::Indexed((n - 90 + 8) as u8),
                n @ 100..=107 => self.pen.bg = Color::Indexed((n - 100 + 8) as u8),
                n @ (38 | 48) => {
                    let (color, used) = extended_color(&values[i + 1..]);
                    if let Some(color) = color {
                        if n == 38 {
                            self.pen.fg = color;
                        } else {
                            self.pen.bg = color;
                        }
                    }
                    i += used;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Parse the tail of a `38`/`48` SGR. Returns the color and how many values
/// it consumed.
fn extended_color(rest: &[u16]) -> (Option<Color>, usize) {
    match rest {
        [5, index, ..] => (Some(Color::Indexed(*index as u8)), 2),
        [2, r, g, b, ..] => (Some(Color::Rgb(*r as u8, *g as u8, *b as u8)), 4),
        [] => (None, 0),
        _ => (None, rest.len()),
    }
}

impl Perform for Grid {
    fn print(&mut self, ch: char) {
        if self.cursor_x >= self.cols {
            self.cursor_x = 0;
            self.line_feed();
        }
        let cell = Cell {
            ch,
            ..self.pen.clone()
        };
        self.cells[self.cursor_y][self.cursor_x] = cell;
        self.cursor_x += 1;
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | 0x0b | 0x0c => self.line_feed(),
            b'\r' => self.cursor_x = 0,
            0x08 => self.cursor_x = self.cursor_x.saturating_sub(1),
            b'\t' => {
                let next_tab = (self.cursor_x / 8 + 1) * 8;
                self.cursor_x = next_tab.min(self.cols - 1);
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        let mut params_iter = params.iter();
        let first = params_iter.next().and_then(|p| p.first().copied()).unwrap_or(0) as usize;
        let second = params_iter.next().and_then(|p| p.first().copied()).unwrap_or(0) as usize;
        let count = first.max(1);

        match action {
            'A' => self.cursor_y = self.cursor_y.saturating_sub(count),
            'B' => self.cursor_y = (self.cursor_y + count).min(self.rows - 1),
            'C' => self.cursor_x = (self.cursor_x + count).min(self.cols - 1),
            'D' => self.cursor_x = self.cursor_x.min(self.cols - 1).saturating_sub(count),
            'G' => self.cursor_x = (count - 1).min(self.cols - 1),
            'd' => self.cursor_y = (count - 1).min(self.rows - 1),
            'H' | 'f' => {
                self.cursor_y = (count - 1).min(self.rows - 1);
                self.cursor_x = (second.max(1) - 1).min(self.cols - 1);
            }
            'J' => {
                let (x, y) = (self.cursor_x, self.cursor_y);
                match first {
                    0 => {
                        self.erase(y, x..self.cols);
                        for row in y + 1..self.rows {
                            self.erase(row, 0..self.cols);
                        }
                    }
                    1 => {
                        for row in 0..y {
                            self.erase(row, 0..self.cols);
                        }
                        self.erase(y, 0..x + 1);
                    }
                    2 | 3 => {
                        for row in 0..self.rows {
                            self.erase(row, 0..self.cols);
                        }
                        if first == 3 {
                            self.scrollback.clear();
                        }
                    }
                    _ => {}
                }
            }
            'K' => {
                let (x, y) = (self.cursor_x, self.cursor_y);
                match first {
                    0 => self.erase(y, x..self.cols),
                    1 => self.erase(y, 0..x + 1),
                    2 => self.erase(y, 0..self.cols),
                    _ => {}
                }
            }
            'm' => self.select_graphic_rendition(params),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        // RIS: full reset
        if byte == b'c' {
            *self = Grid::new(TermSize::new(self.cols as u16, self.rows as u16));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> TerminalSurface {
        TerminalSurface::new(TermSize::new(80, 24))
    }

    #[test]
    fn test_print_basic() {
        let mut term = surface();
        term.process(b"root@vps:~# ");
        assert_eq!(term.line(0), "root@vps:~#");
        assert_eq!(term.cursor(), (12, 0));
    }

    #[test]
    fn test_newline() {
        let mut term = surface();
        term.process(b"Line1\r\nLine2");
        assert_eq!(term.screen_text(), "Line1\nLine2");
    }

    #[test]
    fn test_cursor_movement() {
        let mut term = surface();
        term.process(b"\x1b[5;10HX");
        assert_eq!(term.cell(4, 9).unwrap().ch, 'X');
    }

    #[test]
    fn test_clear_screen() {
        let mut term = surface();
        term.process(b"Some text");
        term.process(b"\x1b[2J");
        assert_eq!(term.line(0), "");
    }

    #[test]
    fn test_output_split_across_chunks() {
        let mut term = surface();
        term.process(b"\x1b[3");
        term.process(b"1mred\x1b[0m plain");
        assert_eq!(term.line(0), "red plain");
        assert_eq!(term.cell(0, 0).unwrap().fg, Color::Indexed(1));
        assert_eq!(term.cell(0, 4).unwrap().fg, Color::Default);
    }

    #[test]
    fn test_sgr_extended_colors() {
        let mut term = surface();
        term.process(b"\x1b[1;38;5;208mA\x1b[48;2;1;2;3mB");
        let a = term.cell(0, 0).unwrap();
        assert!(a.bold);
        assert_eq!(a.fg, Color::Indexed(208));
        assert_eq!(term.cell(0, 1).unwrap().bg, Color::Rgb(1, 2, 3));
    }

    #[test]
    fn test_scrollback() {
        let mut term = TerminalSurface::new(TermSize::new(20, 2));
        term.process(b"one\r\ntwo\r\nthree");
        assert_eq!(term.scrollback().collect::<Vec<_>>(), vec!["one"]);
        assert_eq!(term.screen_text(), "two\nthree");
        assert_eq!(term.text(), "one\ntwo\nthree");
    }

    #[test]
    fn test_notice_keeps_pen() {
        let mut term = surface();
        term.process(b"\x1b[32mok");
        term.write_notice(Notice::Error, "Connection lost");
        term.process(b"x");
        assert_eq!(term.line(1), "Connection lost");
        assert_eq!(term.cell(1, 0).unwrap().fg, Color::Indexed(1));
        assert_eq!(term.cell(2, 0).unwrap().fg, Color::Indexed(2));
        assert_eq!(term.output_log(), b"\x1b[32mokx");
    }

    #[test]
    fn test_resize_keeps_cursor_row() {
        let mut term = TerminalSurface::new(TermSize::new(20, 5));
        term.process(b"a\r\nb\r\nc\r\nd");
        term.resize(TermSize::new(10, 2));
        assert_eq!(term.size(), TermSize::new(10, 2));
        assert_eq!(term.screen_text(), "c\nd");
        assert_eq!(term.cursor(), (1, 1));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut term = TerminalSurface::new(TermSize::new(20, 2));
        term.process(b"one\r\ntwo\r\nthree");
        term.clear();
        assert_eq!(term.text(), "");
        assert!(term.output_log().is_empty());
        assert_eq!(term.cursor(), (0, 0));
    }
}
