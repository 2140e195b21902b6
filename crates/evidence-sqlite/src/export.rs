use crate::{Db, EvidenceRow};
use anyhow::Result;
use std::io::Write;
use std::path::Path;

pub fn write_evidence_csv<W: Write>(rows: &[EvidenceRow], w: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(w);
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes every stored evidence row to `out` as CSV. Returns the row count.
pub fn export_evidence_csv(db: &Db, out: &Path) -> Result<usize> {
    let rows = db.list_evidence()?;
    let file = std::fs::File::create(out)?;
    write_evidence_csv(&rows, file)?;
    Ok(rows.len())
}
