use anyhow::{Result, bail};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Accepts an identifier only if it is usable as exactly one path segment.
/// Rejects separators, `.`/`..`, drive prefixes and control characters.
pub fn ensure_single_segment(value: &str) -> Result<&str> {
    if value.trim().is_empty() {
        bail!("identifier must not be empty");
    }
    if value.chars().any(|c| c.is_control() || matches!(c, '/' | '\\' | ':')) {
        bail!("identifier contains path characters: {value:?}");
    }
    let mut components = Utf8Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Utf8Component::Normal(_)), None) => Ok(value),
        _ => bail!("identifier is not a plain path segment: {value:?}"),
    }
}

/// Join `segment` under `root`, refusing anything that would land outside it.
pub fn join_under_root(root: &Utf8Path, segment: &str) -> Result<Utf8PathBuf> {
    let segment = ensure_single_segment(segment)?;
    let joined = root.join(segment);
    if joined.parent() != Some(root) {
        bail!("path escapes root ({root}): {joined}");
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_are_accepted() {
        let root = Utf8Path::new("/ws/.prismatic/executions");
        let path = join_under_root(root, "U0lFeGVjdXRpb246MQ==").unwrap();
        assert_eq!(path, root.join("U0lFeGVjdXRpb246MQ=="));
    }

    #[test]
    fn traversal_is_rejected() {
        let root = Utf8Path::new("/ws/.prismatic/executions");
        for bad in ["..", ".", "../escape", "a/b", "a\\b", "C:evil", "", "  "] {
            assert!(join_under_root(root, bad).is_err(), "{bad:?} should fail");
        }
    }
}
