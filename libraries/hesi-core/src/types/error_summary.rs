//! Rolling error summaries

use serde::{Deserialize, Serialize};

/// Key used for errors reported outside any scan
pub const GLOBAL_ERROR_KEY: &str = "_global";

/// Maximum number of retained sample messages
pub const MAX_ERROR_SAMPLES: usize = 5;

/// Aggregated errors for one scan (or the global key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    /// Errors reported so far
    pub count: u64,

    /// First messages reported, oldest first
    pub samples: Vec<String>,

    /// Unix epoch milliseconds of the last report
    pub last_updated: i64,
}

impl ErrorSummary {
    /// Empty summary
    pub fn new() -> Self {
        Self {
            count: 0,
            samples: Vec::new(),
            last_updated: super::now_millis(),
        }
    }

    /// Count a new error; keeps the first samples and drops later overflow
    pub fn record(&mut self, message: impl Into<String>) {
        self.count += 1;
        if self.samples.len() < MAX_ERROR_SAMPLES {
            self.samples.push(message.into());
        }
        self.last_updated = super::now_millis();
    }

    /// JSON form handed to error callbacks
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"count\":{}}}", self.count))
    }
}

impl Default for ErrorSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_oldest_samples() {
        let mut summary = ErrorSummary::new();
        for i in 0..8 {
            summary.record(format!("error {i}"));
        }
        assert_eq!(summary.count, 8);
        assert_eq!(summary.samples.len(), MAX_ERROR_SAMPLES);
        assert_eq!(summary.samples[0], "error 0");
        assert_eq!(summary.samples[4], "error 4");
    }

    #[test]
    fn json_shape() {
        let mut summary = ErrorSummary::new();
        summary.record("permission denied");
        let value: serde_json::Value = serde_json::from_str(&summary.to_json()).unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(value["samples"][0], "permission denied");
        assert!(value["lastUpdated"].is_i64());
    }
}
