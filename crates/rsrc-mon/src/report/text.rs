use api_types::ClassReport;
use api_types::PollReport;
use api_types::ReportRow;

use super::ReportEncoder;

const BANNER: &str = "**************************************************";

/// Fixed-width table, one block per device class.
pub struct TextEncoder;

impl TextEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// `HH:MM:SS`, hours not wrapped.
pub fn format_uptime(uptime_secs: u64) -> String {
    let minutes = uptime_secs / 60;
    let hours = minutes / 60;
    format!("{:02}:{:02}:{:02}", hours, minutes % 60, uptime_secs % 60)
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line.trim_end());
    out.push('\n');
}

fn header() -> String {
    format!(
        "{:<4} {:<5} {:<4} {:<10} {:<4} {:<4} {:<14} {:<20}",
        "BEST", "INDEX", "LOAD", "MODEL_LOAD", "MEM", "INST", "DEVICE", "NAMESPACE"
    )
}

fn row(row: &ReportRow) -> String {
    format!(
        "{}    {:<5} {:<4} {:<10} {:<4} {:<4} {:<14} {:<20}",
        if row.best { 'L' } else { ' ' },
        row.identifier,
        row.current_load,
        row.model_load,
        row.memory_usage,
        row.instance_count,
        row.device_path,
        row.namespace_path
    )
}

fn encode_class(out: &mut String, class: &ClassReport) {
    push_line(out, &format!("Num {}s: {}", class.class, class.device_count));
    push_line(out, &header());
    for r in &class.rows {
        push_line(out, &row(r));
    }
}

impl ReportEncoder for TextEncoder {
    fn encode_start(&self) -> String {
        format!("{BANNER}\n")
    }

    fn encode_poll(&self, report: &PollReport) -> String {
        let mut out = String::new();
        push_line(
            &mut out,
            &format!(
                "{} up {} v{}",
                report.timestamp.format("%c"),
                format_uptime(report.uptime_secs),
                report.version
            ),
        );
        for class in &report.classes {
            encode_class(&mut out, class);
        }
        push_line(&mut out, BANNER);
        out
    }
}
