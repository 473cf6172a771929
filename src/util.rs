//! Small helpers shared across the crate.

use std::{fs, path::Path};

use anyhow::{Context, Result};

/// Truncate `s` to at most `max` characters, marking the cut with an
/// ellipsis. `max` must be >= 3.
pub fn truncate_text(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max - 3).collect();
    format!("{head}...")
}

/// Copy `from` into `to` recursively. `to` must not exist yet (the
/// caller removes any stale target first so that re-publication
/// replaces instead of merges).
pub fn copy_dir_all(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create_dir_all {to:?}"))?;
    for entry in fs::read_dir(from).with_context(|| format!("read_dir {from:?}"))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("symlink {link:?} at {target:?}"))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {:?} to {target:?}", entry.path()))?;
        }
    }
    Ok(())
}

/// Read the trailing part of a (log) file, at most `max_len` bytes,
/// lossily decoded. Used for error summaries; the full file stays on
/// disk.
pub fn last_part(path: &Path, max_len: usize) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("reading {path:?}"))?;
    let start = contents.len().saturating_sub(max_len);
    Ok(String::from_utf8_lossy(&contents[start..]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_truncate() {
        assert_eq!(truncate_text("short", 140), "short");
        let long = "x".repeat(200);
        let cut = truncate_text(&long, 140);
        assert_eq!(cut.chars().count(), 140);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn t_copy_dir_all() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let from = tmp.path().join("a");
        fs::create_dir_all(from.join("sub"))?;
        fs::write(from.join("f1"), "one")?;
        fs::write(from.join("sub/f2"), "two")?;
        let to = tmp.path().join("b");
        copy_dir_all(&from, &to)?;
        assert_eq!(fs::read_to_string(to.join("f1"))?, "one");
        assert_eq!(fs::read_to_string(to.join("sub/f2"))?, "two");
        Ok(())
    }
}
