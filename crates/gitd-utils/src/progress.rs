//! Throttled progress reporting, matching C git's progress.c behavior.
//!
//! Displays updates like:
//! - `Receiving objects: 42` (no total)
//! - `Receiving objects:  50% (42/84)` (with total)
//! - `Receiving objects:  50% (42/84), 1.23 MiB | 456.00 KiB/s` (throughput)
//!
//! Output goes to an injectable sink: a serving request routes lines over
//! side-band channel 2, an indexing request hands them to its caller, and
//! standalone use falls back to stderr.

use std::io::{self, Write};
use std::time::Instant;

/// Receiver for formatted progress lines.
pub type ProgressFn<'a> = Box<dyn FnMut(&[u8]) + Send + 'a>;

enum Sink<'a> {
    Stderr,
    Callback(ProgressFn<'a>),
    Discard,
}

/// Progress display with rate limiting and optional throughput tracking.
pub struct Progress<'a> {
    title: String,
    total: Option<u64>,
    current: u64,
    start_time: Instant,
    last_update: Instant,
    /// Minimum delay between display updates in milliseconds.
    delay_ms: u64,
    /// Whether the first update has been displayed.
    started: bool,
    /// Throughput tracking.
    throughput: Option<ThroughputState>,
    /// Last percentage displayed (to avoid redundant updates).
    last_percent: Option<u32>,
    sink: Sink<'a>,
}

struct ThroughputState {
    last_bytes: u64,
    last_time: Instant,
    avg_bytes: f64,
    avg_seconds: f64,
}

impl<'a> Progress<'a> {
    /// Create a progress display that writes to stderr.
    pub fn new(title: &str, total: Option<u64>) -> Self {
        Self::with_sink(title, total, Sink::Stderr)
    }

    /// Create a progress display that hands each line to a callback.
    pub fn with_callback(title: &str, total: Option<u64>, callback: ProgressFn<'a>) -> Self {
        Self::with_sink(title, total, Sink::Callback(callback))
    }

    /// Create a progress display that discards all output.
    pub fn sink_less(title: &str, total: Option<u64>) -> Self {
        Self::with_sink(title, total, Sink::Discard)
    }

    fn with_sink(title: &str, total: Option<u64>, sink: Sink<'a>) -> Self {
        let now = Instant::now();
        Self {
            title: title.to_string(),
            total,
            current: 0,
            start_time: now,
            last_update: now,
            delay_ms: 100,
            started: false,
            throughput: None,
            last_percent: None,
            sink,
        }
    }

    /// Enable throughput display.
    pub fn enable_throughput(&mut self) {
        let now = Instant::now();
        self.throughput = Some(ThroughputState {
            last_bytes: 0,
            last_time: now,
            avg_bytes: 0.0,
            avg_seconds: 0.0,
        });
    }

    /// Update the throughput counter with the total bytes processed so far.
    pub fn display_throughput(&mut self, total_bytes: u64) {
        if let Some(ref mut tp) = self.throughput {
            let now = Instant::now();
            let elapsed = now.duration_since(tp.last_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = total_bytes.saturating_sub(tp.last_bytes) as f64;
                // Exponential moving average
                tp.avg_bytes = tp.avg_bytes * 0.875 + bytes_delta * 0.125;
                tp.avg_seconds = tp.avg_seconds * 0.875 + elapsed * 0.125;
                tp.last_bytes = total_bytes;
                tp.last_time = now;
            }
        }
    }

    /// Update the progress count.
    pub fn update(&mut self, count: u64) {
        self.current = count;

        let now = Instant::now();
        let since_last = now.duration_since(self.last_update).as_millis() as u64;

        // Rate-limit updates
        if self.started && since_last < self.delay_ms {
            // Still display at 100% even if rate-limited
            if let Some(total) = self.total {
                if count < total {
                    return;
                }
            } else {
                return;
            }
        }

        // Check if we actually need to update (percentage changed or no total)
        if let Some(total) = self.total {
            if total > 0 {
                let percent = ((count as f64 / total as f64) * 100.0) as u32;
                if self.started && self.last_percent == Some(percent) && count < total {
                    return;
                }
                self.last_percent = Some(percent);
            }
        }

        self.started = true;
        self.last_update = now;
        self.display();
    }

    /// Increment the count by one.
    pub fn tick(&mut self) {
        self.update(self.current + 1);
    }

    /// Rebind this display to a new phase, keeping the sink.
    ///
    /// A multi-phase task (receive objects, then resolve deltas) reuses one
    /// `Progress` across phases this way.
    pub fn restart(&mut self, title: &str, total: Option<u64>) {
        let now = Instant::now();
        self.title = title.to_string();
        self.total = total;
        self.current = 0;
        self.start_time = now;
        self.last_update = now;
        self.started = false;
        self.last_percent = None;
        self.throughput = None;
    }

    /// Emit the phase-completion line without consuming the display.
    pub fn complete(&mut self) {
        if !self.started {
            return;
        }
        let elapsed = self.start_time.elapsed();
        let elapsed_str = if elapsed.as_secs() > 0 {
            format!(", {:.2}s", elapsed.as_secs_f64())
        } else {
            String::new()
        };

        let line = match self.total {
            Some(total) if total > 0 => {
                format!(
                    "\r{}: 100% ({}/{}){}, done.\n",
                    self.title, total, total, elapsed_str
                )
            }
            _ => {
                format!("\r{}: {}{}, done.\n", self.title, self.current, elapsed_str)
            }
        };
        self.emit(line.as_bytes());
        self.started = false;
    }

    fn display(&mut self) {
        let counters = match self.total {
            Some(total) if total > 0 => {
                let percent = (self.current as f64 / total as f64) * 100.0;
                format!(
                    "\r{}: {:3.0}% ({}/{})",
                    self.title, percent, self.current, total
                )
            }
            _ => {
                format!("\r{}: {}", self.title, self.current)
            }
        };

        let throughput_str = self.format_throughput();

        let line = if throughput_str.is_empty() {
            counters
        } else {
            format!("{}, {}", counters, throughput_str)
        };

        self.emit(line.as_bytes());
    }

    fn emit(&mut self, line: &[u8]) {
        match &mut self.sink {
            Sink::Stderr => {
                let mut stderr = io::stderr();
                let _ = stderr.write_all(line);
                let _ = stderr.flush();
            }
            Sink::Callback(cb) => cb(line),
            Sink::Discard => {}
        }
    }

    fn format_throughput(&self) -> String {
        if let Some(ref tp) = self.throughput {
            if tp.avg_seconds > 0.0 {
                let bytes_per_sec = tp.avg_bytes / tp.avg_seconds;
                let (value, unit) = human_readable_bytes(bytes_per_sec);
                let (total_value, total_unit) = human_readable_bytes(tp.last_bytes as f64);
                format!(
                    "{:.2} {} | {:.2} {}/s",
                    total_value, total_unit, value, unit
                )
            } else {
                String::new()
            }
        } else {
            String::new()
        }
    }

    /// Finish and clear the progress line, emitting "done".
    pub fn finish(mut self) {
        self.complete();
    }
}

/// Convert bytes to human-readable format (matching C git's strbuf_humanise_bytes).
fn human_readable_bytes(bytes: f64) -> (f64, &'static str) {
    if bytes >= 1024.0 * 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0 * 1024.0), "GiB")
    } else if bytes >= 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0), "MiB")
    } else if bytes >= 1024.0 {
        (bytes / 1024.0, "KiB")
    } else {
        (bytes, "bytes")
    }
}
