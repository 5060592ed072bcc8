//! Staged journal dump for failed settlements.

use crate::domain::{JournalLine, TimeMs};
use crate::error::EngineError;
use std::path::{Path, PathBuf};

/// Write the staged journal to `<dir>/<unix-seconds>_journal.csv`.
///
/// This is the operator's record of what the failed run intended to post.
pub(crate) fn dump_journal(
    dir: &Path,
    ts: TimeMs,
    lines: &[JournalLine],
) -> Result<PathBuf, EngineError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_journal.csv", ts.as_i64() / 1000));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["amount", "debit", "credit", "reason", "ts_ms"])?;
    for line in lines {
        writer.write_record([
            line.amount.to_canonical_string(),
            line.debit.as_i64().to_string(),
            line.credit.as_i64().to_string(),
            line.reason.as_str().to_string(),
            ts.as_i64().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(path)
}
