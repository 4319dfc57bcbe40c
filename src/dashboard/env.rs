//! `.env` reading and key-preserving merges.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;

use super::store::write_atomic;
use crate::errors::{DashboardError, DashboardResult};

/// Parse dotenv text into key/value pairs.
pub fn parse_env(content: &str) -> DashboardResult<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for item in dotenvy::from_read_iter(content.as_bytes()) {
        let (key, value) = item.map_err(|e| DashboardError::Validation(format!("Invalid .env: {}", e)))?;
        values.insert(key, value);
    }
    Ok(values)
}

pub fn validate_key(key: &str) -> DashboardResult<()> {
    let mut chars = key.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DashboardError::Validation(format!("Invalid env key '{}'", key)));
    }
    Ok(())
}

fn format_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '$' | '\\'));
    if !needs_quotes {
        return value.to_string();
    }
    if value.is_empty() {
        return String::new();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$");
    format!("\"{}\"", escaped)
}

/// Key defined by a line, if any (`KEY=...` or `export KEY=...`).
fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

/// Overwrite existing keys in place and append new ones; comments, blank
/// lines and unrelated keys are kept as they are.
pub fn merge_env(content: &str, updates: &BTreeMap<String, String>) -> String {
    let mut pending: Vec<&String> = updates.keys().collect();
    let mut out: Vec<String> = Vec::new();

    for line in content.lines() {
        match line_key(line).and_then(|key| updates.get_key_value(key)) {
            Some((key, value)) => {
                out.push(format!("{}={}", key, format_value(value)));
                pending.retain(|k| *k != key);
            }
            None => out.push(line.to_string()),
        }
    }

    if !pending.is_empty() && out.last().is_some_and(|l| !l.trim().is_empty()) {
        out.push(String::new());
    }
    for key in pending {
        out.push(format!("{}={}", key, format_value(&updates[key])));
    }

    let mut merged = out.join("\n");
    merged.push('\n');
    merged
}

pub async fn read_env_file(path: &Path) -> DashboardResult<BTreeMap<String, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_env(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(DashboardError::NotFound(format!("{}", path.display())))
        }
        Err(e) => Err(DashboardError::Other(
            anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
        )),
    }
}

/// Merge `updates` into the file at `path`, creating it when missing.
pub async fn write_env_file(path: &Path, updates: &BTreeMap<String, String>) -> DashboardResult<()> {
    for key in updates.keys() {
        validate_key(key)?;
    }
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(DashboardError::Other(
                anyhow::Error::new(e).context(format!("Failed to read {}", path.display())),
            ));
        }
    };
    let merged = merge_env(&existing, updates);
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, merged.as_bytes()))
        .await
        .context("env write task panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_env_handles_quotes_and_comments() {
        let values = parse_env("# comment\nAPP_NAME=\"My App\"\nDB_PORT=3306\n\nEMPTY=\n").unwrap();
        assert_eq!(values["APP_NAME"], "My App");
        assert_eq!(values["DB_PORT"], "3306");
        assert_eq!(values["EMPTY"], "");
    }

    #[test]
    fn test_merge_preserves_order_comments_and_unrelated_keys() {
        let original = "# Laravel\nAPP_NAME=Laravel\nAPP_KEY=base64:abc\n\n# db\nDB_PORT=3306\n";
        let merged = merge_env(original, &updates(&[("DB_PORT", "3307"), ("REDIS_PORT", "6380")]));
        assert_eq!(
            merged,
            "# Laravel\nAPP_NAME=Laravel\nAPP_KEY=base64:abc\n\n# db\nDB_PORT=3307\n\nREDIS_PORT=6380\n"
        );
    }

    #[test]
    fn test_merge_quotes_values_that_need_it() {
        let merged = merge_env("", &updates(&[("APP_NAME", "My \"Shop\"")]));
        assert_eq!(merged, "APP_NAME=\"My \\\"Shop\\\"\"\n");
        let parsed = parse_env(&merged).unwrap();
        assert_eq!(parsed["APP_NAME"], "My \"Shop\"");
    }

    #[test]
    fn test_merge_updates_export_lines() {
        let merged = merge_env("export APP_ENV=local\n", &updates(&[("APP_ENV", "production")]));
        assert_eq!(merged, "APP_ENV=production\n");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("APP_KEY").is_ok());
        assert!(validate_key("_PRIVATE").is_ok());
        assert!(validate_key("1BAD").is_err());
        assert!(validate_key("BAD-KEY").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn test_write_env_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "APP_NAME=demo\n# keep me\n").unwrap();

        write_env_file(&path, &updates(&[("APP_DEBUG", "true")])).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# keep me"));

        let values = read_env_file(&path).await.unwrap();
        assert_eq!(values["APP_NAME"], "demo");
        assert_eq!(values["APP_DEBUG"], "true");
    }

    #[tokio::test]
    async fn test_write_env_rejects_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_env_file(&dir.path().join(".env"), &updates(&[("BAD KEY", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_missing_env_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_env_file(&dir.path().join(".env")).await.unwrap_err();
        assert!(matches!(err, DashboardError::NotFound(_)));
    }
}
