//! Statistics export.

use crate::stats::{DigitStat, DigitStatsEngine, Percentages, WindowAnalysis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::{self, Write as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Point-in-time copy of the digit statistics for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct StatsExport {
    pub symbol: String,
    pub generated_at: DateTime<Utc>,
    pub window_len: usize,
    pub digit_stats: Vec<DigitStat>,
    pub percentages: Percentages,
    pub analysis: WindowAnalysis,
}

impl StatsExport {
    pub fn from_engine(symbol: &str, engine: &DigitStatsEngine) -> Self {
        Self {
            symbol: symbol.to_string(),
            generated_at: Utc::now(),
            window_len: engine.window_len(),
            digit_stats: engine.stats().to_vec(),
            percentages: engine.percentages(),
            analysis: engine.analysis(),
        }
    }

    pub fn render(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(self).context("Failed to serialize statistics")
            }
            ExportFormat::Csv => Ok(self.to_csv()),
        }
    }

    fn to_csv(&self) -> String {
        let mut out = String::from("digit,count,percentage,rank,power,is_increasing\n");
        for stat in &self.digit_stats {
            let _ = writeln!(
                out,
                "{},{},{:.2},{},{:.2},{}",
                stat.digit, stat.count, stat.percentage, stat.rank, stat.power, stat.is_increasing
            );
        }
        out
    }
}
