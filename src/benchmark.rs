use std::{
    fmt,
    time::{Duration, Instant},
};

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Row, Table};

const DASH: &str = "—";

/// Stage timings for one enhancement cycle, reported when `log_timings` is on.
pub struct CycleBenchmark {
    prompt_name: String,
    model: String,
    triggered_at: Instant,
    capture: Option<Duration>,
    captured_chars: Option<usize>,
    generation: Option<Duration>,
    generated_chars: Option<usize>,
    inject: Option<Duration>,
    finished_at: Option<Instant>,
}

impl CycleBenchmark {
    pub fn new(
        prompt_name: impl Into<String>,
        model: impl Into<String>,
        triggered_at: Instant,
    ) -> Self {
        Self {
            prompt_name: prompt_name.into(),
            model: model.into(),
            triggered_at,
            capture: None,
            captured_chars: None,
            generation: None,
            generated_chars: None,
            inject: None,
            finished_at: None,
        }
    }

    pub fn record_capture(&mut self, duration: Duration, chars: Option<usize>) {
        self.capture = Some(duration);
        self.captured_chars = chars;
    }

    pub fn record_generation(&mut self, duration: Duration, chars: Option<usize>) {
        self.generation = Some(duration);
        self.generated_chars = chars;
    }

    pub fn record_inject(&mut self, duration: Duration) {
        self.inject = Some(duration);
    }

    pub fn mark_finished(&mut self, at: Instant) {
        self.finished_at = Some(at);
    }

    /// `None` until the cycle has finished.
    pub fn finalize(self) -> Option<BenchmarkSummary> {
        let finished_at = self.finished_at?;
        Some(BenchmarkSummary {
            title: format!("{} · {}", self.prompt_name, self.model),
            capture_ms: self.capture.map(as_ms),
            captured_chars: self.captured_chars,
            generation_ms: self.generation.map(as_ms),
            generated_chars: self.generated_chars,
            inject_ms: self.inject.map(as_ms),
            total_ms: as_ms(finished_at.saturating_duration_since(self.triggered_at)),
        })
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn ms_cell(value: Option<f64>) -> Cell {
    let content = value
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| DASH.to_string());
    Cell::new(content).set_alignment(CellAlignment::Right)
}

fn chars_cell(value: Option<usize>) -> Cell {
    let content = value
        .map(|v| v.to_string())
        .unwrap_or_else(|| DASH.to_string());
    Cell::new(content).set_alignment(CellAlignment::Right)
}

pub struct BenchmarkSummary {
    title: String,
    capture_ms: Option<f64>,
    captured_chars: Option<usize>,
    generation_ms: Option<f64>,
    generated_chars: Option<usize>,
    inject_ms: Option<f64>,
    total_ms: f64,
}

impl fmt::Display for BenchmarkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::DynamicFullWidth)
            .force_no_tty();

        table.set_header(vec![
            Cell::new(format!("Cycle · {}", self.title)),
            Cell::new("DUR (ms)"),
            Cell::new("Chars"),
        ]);

        table.add_row(Row::from(vec![
            Cell::new("Capture"),
            ms_cell(self.capture_ms),
            chars_cell(self.captured_chars),
        ]));
        table.add_row(Row::from(vec![
            Cell::new("Generation"),
            ms_cell(self.generation_ms),
            chars_cell(self.generated_chars),
        ]));
        table.add_row(Row::from(vec![
            Cell::new("Inject"),
            ms_cell(self.inject_ms),
            chars_cell(None),
        ]));
        table.add_row(Row::from(vec![
            Cell::new("Total"),
            ms_cell(Some(self.total_ms)),
            chars_cell(None),
        ]));

        f.write_str(&table.trim_fmt())
    }
}
