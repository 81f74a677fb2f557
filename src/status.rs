use crate::{AcquisitionBuffer, Counter, StopHandle, SKIP_SENTINEL};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

/// Live view of a collection, fed only by reads of its buffer.
#[derive(Debug)]
pub struct Status {
    pub counter: Counter,
    pub buffer: AcquisitionBuffer,
    pub labels: Vec<String>,
    pub skips: u64,
    pub last_row: Option<Vec<f64>>,
    pub exit: Option<StatusExit>,
    stop: StopHandle,
    seen_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Finished,
}

impl Status {
    pub fn new(buffer: AcquisitionBuffer, labels: Vec<String>, stop: StopHandle) -> Self {
        Self {
            counter: Counter::default(),
            buffer,
            labels,
            skips: 0,
            last_row: None,
            exit: None,
            stop,
            seen_rows: 0,
        }
    }

    /// Redraws until the user quits or `finished` reports the run is over.
    pub fn run(
        &mut self,
        terminal: &mut DefaultTerminal,
        finished: impl Fn() -> bool,
    ) -> Result<StatusExit> {
        let ticker = tick(Duration::from_millis(250));
        self.counter.reset();

        while self.exit.is_none() {
            let _ = ticker.recv();
            self.refresh();
            self.handle_events()?;
            if self.exit.is_none() && finished() {
                self.refresh();
                self.exit = Some(StatusExit::Finished);
            }
            terminal.draw(|f| self.draw(f))?;
        }

        Ok(self.exit.unwrap_or(StatusExit::Finished))
    }

    /// Pulls rows written since the last refresh.
    pub fn refresh(&mut self) {
        let rows = self.buffer.row_count();
        if rows == self.seen_rows {
            return;
        }
        let fresh = self.buffer.window(self.seen_rows, rows);
        let readings = self.labels.len().saturating_sub(2);
        self.skips += fresh
            .rows()
            .into_iter()
            .map(|r| r.iter().take(readings).filter(|&&v| v == SKIP_SENTINEL).count() as u64)
            .sum::<u64>();
        self.counter.increment(rows - self.seen_rows);
        self.seen_rows = rows;
        self.last_row = self.buffer.last_row();
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit();
        }
    }

    fn exit(&mut self) {
        self.stop.stop();
        self.exit = Some(StatusExit::Quit);
    }
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(" Acquisition Status ".bold());
        let instructions = Line::from(vec![" Stop ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let mut lines = vec![Line::from(vec![
            "Elapsed time: ".into(),
            self.counter
                .t_begin
                .elapsed()
                .as_secs()
                .to_string()
                .yellow(),
            " s".into(),
            " Rows: ".into(),
            format!("{}/{}", self.counter.total_rows, self.buffer.capacity_rows()).yellow(),
            " Scan rate: ".into(),
            format!("{:.1}", self.counter.rate()).yellow(),
            " Hz ".into(),
            " Skips: ".into(),
            self.skips.to_string().yellow(),
        ])];
        if let Some(row) = &self.last_row {
            let cells: Vec<String> = self
                .labels
                .iter()
                .zip(row)
                .map(|(label, value)| format!("{label}: {value:.4}"))
                .collect();
            lines.push(Line::from(cells.join("  ")));
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}
