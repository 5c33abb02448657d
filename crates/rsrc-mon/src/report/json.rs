use api_types::PollReport;

use super::ReportEncoder;

/// One JSON object per poll, one poll per line.
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportEncoder for JsonEncoder {
    fn encode_poll(&self, report: &PollReport) -> String {
        match serde_json::to_string(report) {
            Ok(line) => line + "\n",
            Err(e) => {
                tracing::error!("Failed to serialize poll report: {}", e);
                String::new()
            }
        }
    }
}
