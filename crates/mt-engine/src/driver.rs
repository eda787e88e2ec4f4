//! Benchmark driver report parsing.
//!
//! The driver prints one `name:value` pair per line on stdout, for example
//!
//! ```text
//! correct:12
//! traces:12
//! util:0.871
//! thru:9420
//! perfidx:89
//! ```
//!
//! Correctness problems are reported as lines starting with `ERROR` or
//! containing `[ERROR]`, on either stream.

use mt_types::Metrics;

/// Parsed driver output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverReport {
    pub metrics: Metrics,
    pub errors: Vec<String>,
}

impl DriverReport {
    pub fn parse(stdout: &str, stderr: &str) -> Self {
        let mut report = Self::default();
        for line in stdout.lines().chain(stderr.lines()) {
            let line = line.trim();
            if is_error_line(line) {
                report.errors.push(line.to_string());
            }
        }
        for line in stdout.lines() {
            if let Some((name, value)) = parse_metric(line.trim()) {
                report.metrics.insert(name, value);
            }
        }
        report
    }

    /// First reason the run must be considered incorrect, if any.
    pub fn correctness_violation(&self) -> Option<String> {
        if let Some(first) = self.errors.first() {
            return Some(first.clone());
        }
        match (self.metrics.get("correct"), self.metrics.get("traces")) {
            (Some(correct), Some(traces)) if correct < traces => Some(format!(
                "driver validated {correct} of {traces} traces"
            )),
            _ => None,
        }
    }
}

fn is_error_line(line: &str) -> bool {
    line.starts_with("ERROR") || line.contains("[ERROR]")
}

fn parse_metric(line: &str) -> Option<(String, f64)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let value = value.trim();
    let parsed = match value.strip_suffix('%') {
        Some(pct) => pct.trim().parse::<f64>().ok()? / 100.0,
        None => value.parse::<f64>().ok()?,
    };
    Some((name.to_string(), parsed))
}

/// The first configured crash marker found in `stderr`.
pub fn crash_marker<'a>(stderr: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .find(|m| !m.is_empty() && stderr.contains(m.as_str()))
        .map(String::as_str)
}
