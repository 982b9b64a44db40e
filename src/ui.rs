pub mod screen;

use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Widget,
};

use crate::App;

const HORIZONTAL_MARGIN: u16 = 5;
const VERTICAL_MARGIN: u16 = 2;
const GLYPH_HEIGHT: usize = 5;

impl Widget for &App {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let inner = Layout::default()
            .direction(Direction::Vertical)
            .horizontal_margin(HORIZONTAL_MARGIN)
            .vertical_margin(VERTICAL_MARGIN)
            .constraints([Constraint::Min(0)])
            .split(area)[0];

        screen::current_screen(self.session.phase()).render(self, inner, buf);
    }
}

pub fn bold() -> Style {
    Style::default().add_modifier(Modifier::BOLD)
}

pub fn dim() -> Style {
    Style::default().add_modifier(Modifier::DIM)
}

pub fn colored(color: Color) -> Style {
    bold().fg(color)
}

/// Key hints shown at the bottom of every screen
pub fn hints(pairs: &[(&str, &str)]) -> Line<'static> {
    let mut spans = Vec::new();
    for (i, (key, action)) in pairs.iter().enumerate() {
        if i > 0 {
            spans.push(Span::styled("  ·  ", dim()));
        }
        spans.push(Span::styled(key.to_string(), bold()));
        spans.push(Span::styled(format!(" {}", action), dim()));
    }
    Line::from(spans)
}

/// "3 + 4 - 2" for a round's operands
pub fn expression(numbers: &[i64]) -> String {
    let mut out = String::new();
    for (i, n) in numbers.iter().enumerate() {
        match (i, *n < 0) {
            (0, _) => out.push_str(&n.to_string()),
            (_, true) => out.push_str(&format!(" - {}", n.unsigned_abs())),
            (_, false) => out.push_str(&format!(" + {}", n)),
        }
    }
    out
}

/// Block-letter rendering of a number, `GLYPH_HEIGHT` rows tall
pub fn big_text(text: &str) -> Vec<String> {
    let mut rows = vec![String::new(); GLYPH_HEIGHT];
    for (i, c) in text.chars().enumerate() {
        let Some(glyph) = glyph(c) else {
            continue;
        };
        for (row, part) in rows.iter_mut().zip(glyph) {
            if i > 0 {
                row.push(' ');
            }
            row.push_str(part);
        }
    }
    rows
}

fn glyph(c: char) -> Option<[&'static str; GLYPH_HEIGHT]> {
    let g = match c {
        '0' => ["███", "█ █", "█ █", "█ █", "███"],
        '1' => [" █ ", "██ ", " █ ", " █ ", "███"],
        '2' => ["███", "  █", "███", "█  ", "███"],
        '3' => ["███", "  █", "███", "  █", "███"],
        '4' => ["█ █", "█ █", "███", "  █", "  █"],
        '5' => ["███", "█  ", "███", "  █", "███"],
        '6' => ["███", "█  ", "███", "█ █", "███"],
        '7' => ["███", "  █", "  █", "  █", "  █"],
        '8' => ["███", "█ █", "███", "█ █", "███"],
        '9' => ["███", "█ █", "███", "  █", "███"],
        '-' => ["   ", "   ", "███", "   ", "   "],
        _ => return None,
    };
    Some(g)
}

/// A `width` x `height` rect centered in `area`, clipped to it
pub fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}
