//! Concurrent output multiplexer.
//!
//! Merges the stdout/stderr of several dev processes into one append-only
//! terminal log. Each process writes through its own [`OutputSink`]; every
//! write becomes one [`OutputChunk`] in an ordered history and is rendered
//! as timestamped, prefix-tagged, width-wrapped rows:
//!
//! ```text
//! 2026-08-08 13:11:03 | web        | > dev server listening on :3002
//! 2026-08-08 13:11:03 | extensions | watching extensions/
//! ```
//!
//! Ordering is per-source FIFO; across sources it is arrival order. The
//! write path never awaits, and nothing is dropped on non-interactive
//! terminals: every line is still appended and printed plain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use console::{Color, Style, Term, strip_ansi_codes};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::mpsc;

const TIMESTAMP_COLUMN_WIDTH: usize = 19;
const OUTPUT_MIN_WIDTH: usize = 80;
const MIN_LINE_COLUMN_WIDTH: usize = 16;

const SOURCE_COLORS: [Color; 5] = [
    Color::Yellow,
    Color::Cyan,
    Color::Magenta,
    Color::Green,
    Color::Blue,
];

/// One write from one source, already split into lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub color: Color,
    pub prefix: String,
    pub lines: Vec<String>,
}

#[derive(Default)]
struct SourceRegistry {
    colors: HashMap<String, Color>,
    next_color: usize,
    prefix_width: usize,
}

impl SourceRegistry {
    fn register(&mut self, prefix: &str) -> Color {
        if let Some(color) = self.colors.get(prefix) {
            return *color;
        }
        let color = SOURCE_COLORS[self.next_color % SOURCE_COLORS.len()];
        self.next_color += 1;
        self.colors.insert(prefix.to_string(), color);
        self.prefix_width = self.prefix_width.max(prefix.len());
        color
    }
}

/// Append-only multiplexed view over many process output streams.
///
/// Must be created inside a Tokio runtime; rendering runs on a background
/// task fed by an unbounded channel so producers never block.
pub struct ConcurrentOutput {
    tx: mpsc::UnboundedSender<OutputChunk>,
    history: Arc<Mutex<Vec<OutputChunk>>>,
    registry: Arc<Mutex<SourceRegistry>>,
}

impl ConcurrentOutput {
    pub fn new(show_timestamps: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let registry = Arc::new(Mutex::new(SourceRegistry::default()));

        let render_registry = registry.clone();
        tokio::spawn(async move {
            let term = Term::stdout();
            while let Some(chunk) = rx.recv().await {
                let prefix_width = render_registry.lock().unwrap().prefix_width;
                let width = terminal_width(&term);
                let timestamp = show_timestamps.then(timestamp_now);
                let style = Style::new().fg(chunk.color);
                for row in render_chunk_rows(&chunk, prefix_width, width, timestamp.as_deref()) {
                    println!("{}", style.apply_to(row));
                }
            }
        });

        Self {
            tx,
            history: Arc::new(Mutex::new(Vec::new())),
            registry,
        }
    }

    /// Create a sink for one named source. Sinks for the same prefix share
    /// one color (a process's stdout and stderr render alike); new prefixes
    /// take the next palette color, cycling.
    pub fn sink(&self, prefix: impl Into<String>) -> OutputSink {
        let prefix = prefix.into();
        let color = self.registry.lock().unwrap().register(&prefix);
        OutputSink {
            prefix,
            color,
            tx: self.tx.clone(),
            history: self.history.clone(),
        }
    }

    /// Everything appended so far, in arrival order.
    pub fn history(&self) -> Vec<OutputChunk> {
        self.history.lock().unwrap().clone()
    }

    /// All recorded lines for one source, in emission order.
    pub fn lines_for(&self, prefix: &str) -> Vec<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|chunk| chunk.prefix == prefix)
            .flat_map(|chunk| chunk.lines.iter().cloned())
            .collect()
    }
}

/// Write handle for one source. Cheap to clone into a process task.
#[derive(Clone)]
pub struct OutputSink {
    prefix: String,
    color: Color,
    tx: mpsc::UnboundedSender<OutputChunk>,
    history: Arc<Mutex<Vec<OutputChunk>>>,
}

impl OutputSink {
    /// Append one chunk. Splits on newlines and strips incoming ANSI color
    /// codes; the source's own color is applied at render time instead.
    pub fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let chunk = OutputChunk {
            color: self.color,
            prefix: self.prefix.clone(),
            lines: split_lines(&text),
        };
        self.history.lock().unwrap().push(chunk.clone());
        // The renderer going away (output torn down) just means the chunk
        // stays history-only.
        let _ = self.tx.send(chunk);
    }

    pub fn write_line(&self, line: &str) {
        self.write(line.as_bytes());
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| strip_ansi_codes(line).into_owned())
        .collect();
    if text.ends_with('\n') {
        // Drop the empty segment after the final newline; interior blank
        // lines stay.
        lines.pop();
    }
    lines
}

fn terminal_width(term: &Term) -> usize {
    if term.is_term() {
        let (_rows, cols) = term.size();
        (cols as usize).max(OUTPUT_MIN_WIDTH)
    } else {
        OUTPUT_MIN_WIDTH
    }
}

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

fn local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

fn timestamp_now() -> String {
    let now = OffsetDateTime::now_utc().to_offset(local_offset());
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Split a line into fixed-width segments so wrapped output stays inside
/// the line column.
fn chunk_string(line: &str, width: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.len() <= width {
        return vec![line.to_string()];
    }
    chars
        .chunks(width)
        .map(|segment| segment.iter().collect())
        .collect()
}

/// Render one chunk into plain rows. The first segment of each line carries
/// the timestamp and prefix; continuation segments keep the columns blank so
/// the gutters stay aligned.
fn render_chunk_rows(
    chunk: &OutputChunk,
    prefix_width: usize,
    terminal_width: usize,
    timestamp: Option<&str>,
) -> Vec<String> {
    let overhead = prefix_width + 3 + timestamp.map_or(0, |_| TIMESTAMP_COLUMN_WIDTH + 3);
    let line_width = terminal_width
        .saturating_sub(overhead)
        .max(MIN_LINE_COLUMN_WIDTH);

    let mut rows = Vec::new();
    for line in &chunk.lines {
        for (index, segment) in chunk_string(line, line_width).into_iter().enumerate() {
            let head = index == 0;
            let mut row = String::new();
            if let Some(ts) = timestamp {
                let ts = if head { ts } else { "" };
                let ts_width = TIMESTAMP_COLUMN_WIDTH;
                row.push_str(&format!("{ts:<ts_width$} | "));
            }
            let prefix = if head { chunk.prefix.as_str() } else { "" };
            row.push_str(&format!("{prefix:<prefix_width$} | {segment}"));
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(prefix: &str, lines: &[&str]) -> OutputChunk {
        OutputChunk {
            color: Color::Yellow,
            prefix: prefix.to_string(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn split_lines_drops_only_the_trailing_newline_segment() {
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines("a\n\nb"), vec!["a", "", "b"]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn split_lines_strips_ansi_codes() {
        assert_eq!(split_lines("\x1b[31mred\x1b[0m\n"), vec!["red"]);
    }

    #[test]
    fn chunk_string_wraps_at_width() {
        assert_eq!(chunk_string("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(chunk_string("abc", 4), vec!["abc"]);
    }

    #[test]
    fn rows_carry_prefix_only_on_the_first_segment() {
        let rows = render_chunk_rows(&chunk("web", &["aaaabbbb"]), 3, 26, None);
        assert_eq!(rows, vec!["web | aaaabbbb"]);

        let long = "x".repeat(20);
        let rows = render_chunk_rows(&chunk("web", &[&long]), 3, 22, None);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("web | "));
        assert!(rows[1].starts_with("    | "));
    }

    #[test]
    fn rows_include_timestamp_column_when_enabled() {
        let rows = render_chunk_rows(
            &chunk("web", &["hello"]),
            5,
            80,
            Some("2026-08-08 13:11:03"),
        );
        assert_eq!(rows, vec!["2026-08-08 13:11:03 | web   | hello"]);
    }

    #[test]
    fn timestamp_matches_the_column_width() {
        assert_eq!(timestamp_now().len(), TIMESTAMP_COLUMN_WIDTH);
    }

    #[tokio::test]
    async fn sinks_for_one_prefix_share_a_color() {
        let output = ConcurrentOutput::new(false);
        let stdout = output.sink("web");
        let stderr = output.sink("web");
        let other = output.sink("extensions");

        stdout.write_line("a");
        stderr.write_line("b");
        other.write_line("c");

        let history = output.history();
        assert_eq!(history[0].color, history[1].color);
        assert_ne!(history[0].color, history[2].color);
    }

    #[tokio::test]
    async fn writes_from_one_source_stay_in_order() {
        let output = ConcurrentOutput::new(false);
        let sink = output.sink("web");
        sink.write_line("first");
        sink.write(b"second\nthird\n");

        assert_eq!(output.lines_for("web"), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn each_write_appends_exactly_one_chunk() {
        let output = ConcurrentOutput::new(false);
        let sink = output.sink("web");
        sink.write(b"one\ntwo\n");
        sink.write(b"");

        let history = output.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].lines, vec!["one", "two"]);
        assert!(history[1].lines.is_empty());
    }
}
