use std::io;
use std::io::Write;

use api_types::PollReport;

use crate::config::OutputFormat;

pub mod json;
pub mod text;

/// Renders poll reports into one output format.
pub trait ReportEncoder {
    /// Output written once, before the first poll.
    fn encode_start(&self) -> String {
        String::new()
    }

    fn encode_poll(&self, report: &PollReport) -> String;
}

pub fn encoder_for(format: OutputFormat) -> Box<dyn ReportEncoder> {
    match format {
        OutputFormat::Text => Box::new(text::TextEncoder::new()),
        OutputFormat::Json => Box::new(json::JsonEncoder::new()),
    }
}

/// Writes encoded reports to the operator's output, flushing after each one.
pub struct ReportSink<W: Write> {
    encoder: Box<dyn ReportEncoder>,
    out: W,
}

impl<W: Write> ReportSink<W> {
    pub fn new(encoder: Box<dyn ReportEncoder>, out: W) -> Self {
        Self { encoder, out }
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.write(self.encoder.encode_start())
    }

    pub fn emit(&mut self, report: &PollReport) -> io::Result<()> {
        self.write(self.encoder.encode_poll(report))
    }

    fn write(&mut self, rendered: String) -> io::Result<()> {
        if rendered.is_empty() {
            return Ok(());
        }
        self.out.write_all(rendered.as_bytes())?;
        self.out.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}
