//! Work item batch files.

use std::path::Path;

use anyhow::Context;

use armada_orchestration::scheduler::WorkItem;

/// Read a JSON array of work items.
pub fn load_batch(path: &Path) -> anyhow::Result<Vec<WorkItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {}", path.display()))?;
    parse_batch(&content).with_context(|| format!("Invalid batch file {}", path.display()))
}

pub fn parse_batch(content: &str) -> anyhow::Result<Vec<WorkItem>> {
    let items: Vec<WorkItem> = serde_json::from_str(content)?;
    if items.is_empty() {
        anyhow::bail!("batch contains no work items");
    }
    Ok(items)
}

/// Pool key for an item: its owner tag, else its type, else `"default"`.
pub fn worker_type_of(item: &WorkItem) -> &str {
    item.owner_tag
        .as_deref()
        .filter(|tag| !tag.is_empty())
        .or_else(|| (!item.kind.is_empty()).then_some(item.kind.as_str()))
        .unwrap_or("default")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn load_batch_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            r#"[{"id": "a", "estimatedDuration": 3}, {"id": "b", "dependsOn": ["a"]}]"#,
        )
        .unwrap();

        let items = load_batch(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].depends_on, vec!["a"]);
    }

    #[test]
    fn missing_file_names_path() {
        let err = load_batch(Path::new("/nonexistent/batch.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/batch.json"));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(parse_batch("[]").is_err());
        assert!(parse_batch("{}").is_err());
    }

    #[test]
    fn worker_type_prefers_owner_then_kind() {
        let item = WorkItem::new("a", "A");
        assert_eq!(worker_type_of(&item), "default");
        let item = item.with_kind("testing");
        assert_eq!(worker_type_of(&item), "testing");
        let item = item.with_owner("qa");
        assert_eq!(worker_type_of(&item), "qa");
    }
}
