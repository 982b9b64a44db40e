use chrono::Local;
use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::Color,
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Widget, Wrap},
};

use anzan::{attempts::score, exercise::Phase, session::Feedback, util};

use crate::{
    ui::{big_text, bold, centered, colored, dim, expression, hints},
    App,
};

const RECENT_ROUNDS: usize = 8;

/// A UI Screen boundary: renders one phase of the session
pub trait Screen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer);
}

/// Splits the area into a header line, a body and a hint line
fn frame(area: Rect) -> [Rect; 3] {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(area);
    [chunks[0], chunks[1], chunks[2]]
}

fn center_lines(lines: Vec<Line<'static>>, area: Rect, buf: &mut Buffer) {
    let height = lines.len() as u16;
    Paragraph::new(lines)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: false })
        .render(centered(area, area.width, height), buf);
}

fn header(app: &App, detail: String) -> Paragraph<'static> {
    let session = &app.session;
    Paragraph::new(Line::from(vec![
        Span::styled(session.config().exercise_type_name.clone(), bold()),
        Span::styled(format!("  ·  round {}  ·  ", session.round().max(1)), dim()),
        Span::styled(detail, dim()),
    ]))
}

fn tally(app: &App) -> Line<'static> {
    Line::from(Span::styled(
        format!(
            "Correct {} / {}",
            app.session.total_correct(),
            app.session.total_attempts()
        ),
        dim(),
    ))
}

/// Idle and the network waits before a round is on screen
pub struct LoadingScreen;

impl Screen for LoadingScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let [_, body, footer] = frame(area);
        let message = match app.session.phase() {
            Phase::Idle => "Press Enter to start",
            Phase::Initializing => "Starting exercise…",
            _ => "Preparing numbers…",
        };
        center_lines(
            vec![Line::from(Span::styled(message, colored(Color::Yellow)))],
            body,
            buf,
        );
        hints(&[("q", "quit")]).render(footer, buf);
    }
}

/// One operand at a time, in block digits
pub struct FlashScreen;

impl Screen for FlashScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let session = &app.session;
        let [top, body, footer] = frame(area);
        let position = session.display_index().map_or(0, |i| i + 1);
        header(app, format!("card {} / {}", position, session.card_count())).render(top, buf);

        if let Some(value) = session.current_operand() {
            let lines = big_text(&value.to_string())
                .into_iter()
                .map(|row| Line::from(Span::styled(row, colored(Color::Cyan))))
                .collect();
            center_lines(lines, body, buf);
        }
        hints(&[("n", "new round"), ("q", "finish")]).render(footer, buf);
    }
}

pub struct AnswerScreen;

impl Screen for AnswerScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let session = &app.session;
        let [top, body, footer] = frame(area);
        let remaining = session.remaining_secs().unwrap_or(0);
        let clock_style = if remaining <= 3 {
            colored(Color::Red)
        } else {
            colored(Color::Green)
        };
        header(app, format!("{} cards", session.card_count())).render(top, buf);

        center_lines(
            vec![
                Line::from(Span::styled(format!("{}s", remaining), clock_style)),
                Line::default(),
                Line::from(Span::styled("Total?", bold())),
                Line::from(vec![
                    Span::styled(session.answer_input().to_string(), colored(Color::Cyan)),
                    Span::styled("_", dim()),
                ]),
            ],
            body,
            buf,
        );
        hints(&[("Enter", "submit"), ("n", "new round"), ("q", "finish")]).render(footer, buf);
    }
}

pub struct ValidatingScreen;

impl Screen for ValidatingScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let [top, body, _] = frame(area);
        header(app, String::new()).render(top, buf);
        center_lines(
            vec![Line::from(Span::styled(
                format!("Checking {}…", app.session.answer_input()),
                colored(Color::Yellow),
            ))],
            body,
            buf,
        );
    }
}

pub struct FeedbackScreen;

impl Screen for FeedbackScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let session = &app.session;
        let [top, body, footer] = frame(area);
        header(app, String::new()).render(top, buf);

        let (headline, color) = match session.feedback() {
            Feedback::Correct => ("Correct!", Color::Green),
            Feedback::Incorrect => ("Incorrect", Color::Red),
            Feedback::Timeout => ("Time's up!", Color::Yellow),
            Feedback::None => ("", Color::Reset),
        };
        let mut lines = vec![
            Line::from(Span::styled(headline, colored(color))),
            Line::default(),
        ];
        if let Some(sequence) = session.revealed_sequence() {
            lines.push(Line::from(Span::styled(
                format!(
                    "{} = {}",
                    expression(&sequence.numbers),
                    util::format_number(sequence.expected_answer)
                ),
                bold(),
            )));
        }
        if let Some(answer) = session.rounds().last().and_then(|r| r.answer) {
            if !session.feedback().is_correct() {
                lines.push(Line::from(Span::styled(
                    format!("you answered {}", util::format_number(answer)),
                    dim(),
                )));
            }
        }
        lines.push(Line::default());
        lines.push(tally(app));
        center_lines(lines, body, buf);

        hints(&[("Enter", "next round"), ("q", "finish")]).render(footer, buf);
    }
}

pub struct FailedScreen;

impl Screen for FailedScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let [_, body, footer] = frame(area);
        let message = app
            .session
            .error()
            .map_or("Something went wrong.", |e| e.user_message());
        center_lines(
            vec![Line::from(Span::styled(message, colored(Color::Red)))],
            body,
            buf,
        );
        hints(&[("r", "retry"), ("q", "finish")]).render(footer, buf);
    }
}

/// Final tally, the latest rounds, and newly earned achievements one at a time
pub struct SummaryScreen;

impl Screen for SummaryScreen {
    fn render(&self, app: &App, area: Rect, buf: &mut Buffer) {
        let session = &app.session;
        let [top, body, footer] = frame(area);
        Paragraph::new(Line::from(Span::styled("Session complete", colored(Color::Magenta))))
            .render(top, buf);

        let mut lines = vec![Line::from(vec![
            Span::styled(
                format!(
                    "Correct {} / {}",
                    session.total_correct(),
                    session.total_attempts()
                ),
                bold(),
            ),
            Span::styled(
                format!(
                    "  ·  score {}%",
                    score(session.total_correct(), session.total_attempts())
                ),
                dim(),
            ),
        ])];
        if let Some(avg) = util::mean_response_time(session.rounds()) {
            lines.push(Line::from(Span::styled(
                format!("average answer time {:.1}s", avg.as_secs_f64()),
                dim(),
            )));
        }
        if session.is_finalizing() {
            lines.push(Line::from(Span::styled("Saving results…", colored(Color::Yellow))));
        }
        lines.push(Line::default());

        let rounds = session.rounds();
        for round in rounds.iter().skip(rounds.len().saturating_sub(RECENT_ROUNDS)) {
            let (mark, color) = match round.feedback {
                Feedback::Correct => ("✓", Color::Green),
                Feedback::Timeout => ("⏱", Color::Yellow),
                _ => ("✗", Color::Red),
            };
            lines.push(Line::from(vec![
                Span::styled(format!("{} ", mark), colored(color)),
                Span::raw(format!(
                    "{} = {}",
                    expression(&round.numbers),
                    util::format_number(round.expected_answer)
                )),
            ]));
        }

        if !app.past_attempts.is_empty() {
            lines.push(Line::default());
            lines.push(Line::from(Span::styled("Recent sessions", bold())));
            for row in &app.past_attempts {
                let result = match row.score {
                    Some(score) if row.completed_at.is_some() => format!(
                        "{} / {}  {}%",
                        row.total_correct, row.total_attempts, score
                    ),
                    _ => "unfinished".to_string(),
                };
                lines.push(Line::from(vec![
                    Span::styled(
                        format!("{}  ", row.started_at.with_timezone(&Local).format("%b %d %H:%M")),
                        dim(),
                    ),
                    Span::raw(result),
                ]));
            }
        }
        Paragraph::new(lines).render(body, buf);

        if let Some(achievement) = session.achievements().current() {
            let popup = centered(body, 44, 7);
            Clear.render(popup, buf);
            let left = session.achievements().len() - 1;
            Paragraph::new(vec![
                Line::from(Span::styled(achievement.title.clone(), colored(Color::Yellow))),
                Line::from(Span::raw(achievement.description.clone())),
                Line::default(),
                Line::from(Span::styled(
                    match left {
                        0 => "Enter to continue".to_string(),
                        n => format!("Enter for the next one ({} more)", n),
                    },
                    dim(),
                )),
            ])
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(" Achievement unlocked "),
            )
            .render(popup, buf);
        }

        if app.is_quitting() {
            hints(&[("ctrl+c", "quit without saving")]).render(footer, buf);
        } else {
            hints(&[("Enter", "close"), ("q", "quit")]).render(footer, buf);
        }
    }
}

/// Helper to construct the appropriate screen for the current phase
pub fn current_screen(phase: Phase) -> Box<dyn Screen> {
    match phase {
        Phase::Idle | Phase::Initializing | Phase::Loading => Box::new(LoadingScreen),
        Phase::Displaying => Box::new(FlashScreen),
        Phase::AwaitingAnswer => Box::new(AnswerScreen),
        Phase::Validating => Box::new(ValidatingScreen),
        Phase::Feedback => Box::new(FeedbackScreen),
        Phase::Failed => Box::new(FailedScreen),
        Phase::Completed => Box::new(SummaryScreen),
    }
}
