//! Roster files: a JSON array of `{identityId, photoPath}` objects, or a CSV
//! table with `identityId,photoPath` headers.

use anyhow::{bail, Context, Result};
use portrait_core::RosterEntry;
use std::path::{Path, PathBuf};

const ID_HEADERS: &[&str] = &["identityid", "playerid", "id"];
const PHOTO_HEADERS: &[&str] = &["photopath", "photo"];

/// Load a roster. The format follows the extension (`.csv`, otherwise JSON).
/// Relative photo paths resolve against the roster file's directory; empty
/// paths mean "no photo".
pub fn load(path: &Path) -> Result<Vec<RosterEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster {}", path.display()))?;

    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

    let mut entries = if is_csv {
        parse_csv(&text).with_context(|| format!("invalid CSV roster {}", path.display()))?
    } else {
        serde_json::from_str::<Vec<RosterEntry>>(&text)
            .with_context(|| format!("invalid JSON roster {}", path.display()))?
    };

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.identity_id = entry.identity_id.trim().to_string();
        if entry.identity_id.is_empty() {
            bail!("roster {}: entry {} has an empty identity id", path.display(), index + 1);
        }
        entry.photo_path = entry.photo_path.take().and_then(|p| resolve_photo(base, p));
    }

    tracing::debug!(
        roster = %path.display(),
        entries = entries.len(),
        with_photo = entries.iter().filter(|e| e.photo_path.is_some()).count(),
        "loaded roster"
    );
    Ok(entries)
}

fn resolve_photo(base: &Path, photo: PathBuf) -> Option<PathBuf> {
    if photo.as_os_str().to_string_lossy().trim().is_empty() {
        return None;
    }
    if photo.is_relative() {
        return Some(base.join(photo));
    }
    Some(photo)
}

fn parse_csv(text: &str) -> Result<Vec<RosterEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |names: &[&str]| {
        headers
            .iter()
            .position(|h| names.contains(&h.to_ascii_lowercase().as_str()))
    };
    let Some(id_col) = column(ID_HEADERS) else {
        bail!("missing identity column (expected one of: identityId, PlayerId)");
    };
    let photo_col = column(PHOTO_HEADERS);

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let photo = photo_col
            .and_then(|c| record.get(c))
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        entries.push(RosterEntry::new(record.get(id_col).unwrap_or_default(), photo));
    }
    Ok(entries)
}
