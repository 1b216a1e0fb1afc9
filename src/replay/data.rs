//! Recorded tick loading.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::Path;

/// One recorded tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRow {
    pub epoch: i64,
    pub quote: Decimal,
}

impl TickRow {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.epoch, 0)
    }

    fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 2 {
            anyhow::bail!("Expected 2 columns (epoch,quote), got {}", parts.len());
        }

        Ok(Self {
            epoch: parts[0]
                .trim()
                .parse()
                .with_context(|| format!("Invalid epoch: {}", parts[0]))?,
            // Keep the quote text as written so trailing zeros survive
            quote: parts[1]
                .trim()
                .parse()
                .with_context(|| format!("Invalid quote: {}", parts[1]))?,
        })
    }
}

/// CSV tick loader.
///
/// Expected format:
/// ```csv
/// epoch,quote
/// 1700000000,1234.56
/// 1700000002,1234.61
/// ```
#[derive(Debug, Clone)]
pub struct TickCsvLoader {
    ticks: Vec<TickRow>,
}

impl TickCsvLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tick file: {}", path.display()))?;

        Self::from_csv_content(&content)
    }

    pub fn from_csv_content(content: &str) -> Result<Self> {
        let mut ticks = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line_num == 0 && line.trim_start().starts_with("epoch") {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let row = TickRow::parse(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            ticks.push(row);
        }

        if ticks.is_empty() {
            anyhow::bail!("Tick file contains no data rows");
        }

        // Stable, so ticks sharing an epoch keep file order
        ticks.sort_by_key(|t| t.epoch);
        Ok(Self { ticks })
    }

    pub fn from_ticks(ticks: Vec<TickRow>) -> Self {
        Self { ticks }
    }

    pub fn ticks(&self) -> &[TickRow] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn available_range(&self) -> Option<(i64, i64)> {
        Some((self.ticks.first()?.epoch, self.ticks.last()?.epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_csv_parsing() {
        let csv = "epoch,quote\n1700000004,1234.60\n1700000002,1234.56\n\n1700000006,1234.7\n";
        let loader = TickCsvLoader::from_csv_content(csv).unwrap();

        assert_eq!(loader.len(), 3);
        assert_eq!(loader.available_range(), Some((1700000002, 1700000006)));
        assert_eq!(loader.ticks()[0].quote, dec!(1234.56));
        // Trailing zero is preserved
        assert_eq!(loader.ticks()[1].quote.to_string(), "1234.60");
    }

    #[test]
    fn test_headerless_file() {
        let loader = TickCsvLoader::from_csv_content("1,10.01\n2,10.02").unwrap();
        assert_eq!(loader.len(), 2);
    }

    #[test]
    fn test_rejects_bad_rows() {
        let err = TickCsvLoader::from_csv_content("epoch,quote\n1,abc\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));

        assert!(TickCsvLoader::from_csv_content("epoch,quote\n").is_err());
        assert!(TickCsvLoader::from_csv_content("1700000000\n").is_err());
    }
}
