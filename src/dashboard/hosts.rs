//! Marker-delimited section of the OS hosts file.
//!
//! Only lines between [`BEGIN_MARKER`] and [`END_MARKER`] are ever touched;
//! every other line of the file is written back byte-for-byte.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::Mutex;

use super::models::DomainMapping;
use crate::errors::{DashboardError, DashboardResult};
use crate::util::validate_domain;

pub const BEGIN_MARKER: &str = "# >>> devdock managed >>>";
pub const END_MARKER: &str = "# <<< devdock managed <<<";

pub const DEFAULT_IP: &str = "127.0.0.1";

/// Platform hosts file location.
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

fn parse_line(line: &str) -> Option<DomainMapping> {
    let (entry, comment) = match line.split_once('#') {
        Some((entry, comment)) => (entry, Some(comment.trim())),
        None => (line, None),
    };
    let mut fields = entry.split_whitespace();
    let ip = fields.next()?;
    let domain = fields.next()?;
    Some(DomainMapping {
        domain: domain.to_string(),
        ip: ip.to_string(),
        project: comment.filter(|c| !c.is_empty()).map(str::to_string),
    })
}

fn format_line(mapping: &DomainMapping) -> String {
    match &mapping.project {
        Some(project) => format!("{} {} # {}", mapping.ip, mapping.domain, project),
        None => format!("{} {}", mapping.ip, mapping.domain),
    }
}

/// Mappings inside the managed section. A missing section yields none.
pub fn parse_managed(content: &str) -> Vec<DomainMapping> {
    let mut inside = false;
    let mut mappings = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == BEGIN_MARKER {
            inside = true;
        } else if trimmed == END_MARKER {
            inside = false;
        } else if inside && !trimmed.is_empty() && !trimmed.starts_with('#') {
            if let Some(mapping) = parse_line(trimmed) {
                mappings.push(mapping);
            }
        }
    }
    mappings
}

/// Replace the managed section with `mappings`, appending one when absent.
/// An empty mapping list removes the section entirely.
pub fn render_managed(content: &str, mappings: &[DomainMapping]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut inside = false;
    let mut replaced = false;

    let section: Vec<String> = if mappings.is_empty() {
        Vec::new()
    } else {
        std::iter::once(BEGIN_MARKER.to_string())
            .chain(mappings.iter().map(format_line))
            .chain(std::iter::once(END_MARKER.to_string()))
            .collect()
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == BEGIN_MARKER {
            inside = true;
            if !replaced {
                out.extend(section.iter().cloned());
                replaced = true;
            }
            continue;
        }
        if inside {
            if trimmed == END_MARKER {
                inside = false;
            }
            continue;
        }
        out.push(line.to_string());
    }

    if !replaced && !section.is_empty() {
        if out.last().is_some_and(|l| !l.trim().is_empty()) {
            out.push(String::new());
        }
        out.extend(section);
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

/// Lines a user would paste by hand when the file isn't writable.
pub fn manual_instructions(path: &Path, mappings: &[DomainMapping]) -> String {
    let mut text = format!(
        "Add the following lines to {} (requires administrator rights):\n",
        path.display()
    );
    text.push_str(BEGIN_MARKER);
    text.push('\n');
    for mapping in mappings {
        text.push_str(&format_line(mapping));
        text.push('\n');
    }
    text.push_str(END_MARKER);
    text.push('\n');
    text
}

/// Serialized access to the hosts file.
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> DashboardResult<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(DashboardError::Other(
                anyhow::Error::new(e).context(format!("Failed to read {}", self.path.display())),
            )),
        }
    }

    pub async fn list(&self) -> DashboardResult<Vec<DomainMapping>> {
        Ok(parse_managed(&self.read().await?))
    }

    /// Add or replace the mapping for `mapping.domain`.
    pub async fn add(&self, mapping: DomainMapping) -> DashboardResult<Vec<DomainMapping>> {
        validate_domain(&mapping.domain)?;
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        let mut mappings = parse_managed(&content);
        mappings.retain(|m| m.domain != mapping.domain);
        mappings.push(mapping);
        self.write(&content, &mappings).await?;
        Ok(mappings)
    }

    /// Remove the mapping for `domain`.
    pub async fn remove(&self, domain: &str) -> DashboardResult<Vec<DomainMapping>> {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        let mut mappings = parse_managed(&content);
        let before = mappings.len();
        mappings.retain(|m| m.domain != domain);
        if mappings.len() == before {
            return Err(DashboardError::NotFound(format!("Domain '{}'", domain)));
        }
        self.write(&content, &mappings).await?;
        Ok(mappings)
    }

    /// Drop every mapping tagged with `project`. Returns how many were removed.
    pub async fn remove_project(&self, project: &str) -> DashboardResult<usize> {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        let mut mappings = parse_managed(&content);
        let before = mappings.len();
        mappings.retain(|m| m.project.as_deref() != Some(project));
        let removed = before - mappings.len();
        if removed > 0 {
            self.write(&content, &mappings).await?;
        }
        Ok(removed)
    }

    // In-place write keeps the file's owner and mode; a rename would not.
    async fn write(&self, original: &str, mappings: &[DomainMapping]) -> DashboardResult<()> {
        let rendered = render_managed(original, mappings);
        match tokio::fs::write(&self.path, rendered).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), entries = mappings.len(), "hosts file updated");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                tracing::warn!(path = %self.path.display(), "no permission to write hosts file");
                Err(DashboardError::Permission {
                    message: format!("Cannot write {}", self.path.display()),
                    instructions: Some(manual_instructions(&self.path, mappings)),
                })
            }
            Err(e) => Err(DashboardError::Other(
                anyhow::Error::new(e)
                    .context(format!("Failed to write {}", self.path.display())),
            )),
        }
    }
}

/// Read-only helper for the CLI.
pub fn read_managed(path: &Path) -> anyhow::Result<Vec<DomainMapping>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(parse_managed(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM: &str = "127.0.0.1 localhost\n::1 localhost\n# corporate vpn\n10.0.0.5 intranet.corp\n";

    fn mapping(domain: &str, project: Option<&str>) -> DomainMapping {
        DomainMapping {
            domain: domain.to_string(),
            ip: DEFAULT_IP.to_string(),
            project: project.map(str::to_string),
        }
    }

    fn with_section(lines: &[&str]) -> String {
        let mut content = SYSTEM.to_string();
        content.push_str(BEGIN_MARKER);
        content.push('\n');
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        content.push_str(END_MARKER);
        content.push('\n');
        content
    }

    #[test]
    fn test_parse_ignores_lines_outside_section() {
        let content = with_section(&["127.0.0.1 shop.test # shop", "127.0.0.1 blog.test"]);
        let mappings = parse_managed(&content);
        assert_eq!(mappings, vec![mapping("shop.test", Some("shop")), mapping("blog.test", None)]);
        assert!(parse_managed(SYSTEM).is_empty());
    }

    #[test]
    fn test_render_appends_section_when_absent() {
        let rendered = render_managed(SYSTEM, &[mapping("shop.test", Some("shop"))]);
        assert!(rendered.starts_with(SYSTEM));
        assert!(rendered.contains(&format!("{}\n127.0.0.1 shop.test # shop\n{}\n", BEGIN_MARKER, END_MARKER)));
    }

    #[test]
    fn test_remove_one_of_n_preserves_everything_else() {
        let content = with_section(&[
            "127.0.0.1 a.test # a",
            "127.0.0.1 b.test # b",
            "127.0.0.1 c.test # c",
        ]);
        let mut mappings = parse_managed(&content);
        assert_eq!(mappings.len(), 3);
        mappings.retain(|m| m.domain != "b.test");

        let rendered = render_managed(&content, &mappings);
        let after = parse_managed(&rendered);
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|m| m.domain != "b.test"));
        assert!(rendered.starts_with(SYSTEM));
        assert_eq!(rendered.lines().count(), content.lines().count() - 1);
    }

    #[test]
    fn test_render_empty_removes_section() {
        let content = with_section(&["127.0.0.1 a.test"]);
        let rendered = render_managed(&content, &[]);
        assert_eq!(rendered, SYSTEM);
    }

    #[test]
    fn test_render_keeps_content_after_section() {
        let mut content = with_section(&["127.0.0.1 a.test"]);
        content.push_str("192.168.1.10 nas.local\n");
        let rendered = render_managed(&content, &[mapping("z.test", None)]);
        assert!(rendered.ends_with("192.168.1.10 nas.local\n"));
        assert!(!rendered.contains("a.test"));
        assert!(rendered.contains("127.0.0.1 z.test"));
    }

    #[test]
    fn test_manual_instructions_list_lines() {
        let text = manual_instructions(Path::new("/etc/hosts"), &[mapping("shop.test", Some("shop"))]);
        assert!(text.contains("/etc/hosts"));
        assert!(text.contains("127.0.0.1 shop.test # shop"));
        assert!(text.contains(BEGIN_MARKER));
    }

    #[tokio::test]
    async fn test_add_and_remove_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, SYSTEM).unwrap();
        let hosts = HostsFile::new(&path);

        hosts.add(mapping("shop.test", Some("shop"))).await.unwrap();
        hosts.add(mapping("api.shop.test", Some("shop"))).await.unwrap();
        // Re-adding replaces rather than duplicates.
        hosts.add(mapping("shop.test", Some("shop"))).await.unwrap();
        assert_eq!(hosts.list().await.unwrap().len(), 2);

        hosts.remove("api.shop.test").await.unwrap();
        let left = hosts.list().await.unwrap();
        assert_eq!(left, vec![mapping("shop.test", Some("shop"))]);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with(SYSTEM));

        let err = hosts.remove("missing.test").await.unwrap_err();
        assert!(matches!(err, DashboardError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_project_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, with_section(&["127.0.0.1 a.test # a", "127.0.0.1 b.test # b"])).unwrap();
        let hosts = HostsFile::new(&path);
        assert_eq!(hosts.remove_project("a").await.unwrap(), 1);
        assert_eq!(hosts.list().await.unwrap(), vec![mapping("b.test", Some("b"))]);
        assert_eq!(hosts.remove_project("zzz").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = HostsFile::new(dir.path().join("hosts"));
        let err = hosts.add(mapping("bad domain", None)).await.unwrap_err();
        assert!(matches!(err, DashboardError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_file_returns_permission_with_instructions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, SYSTEM).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

        // Root ignores file modes; nothing to assert in that case.
        if std::fs::OpenOptions::new().write(true).open(&path).is_ok() {
            return;
        }

        let hosts = HostsFile::new(&path);
        match hosts.add(mapping("shop.test", None)).await.unwrap_err() {
            DashboardError::Permission { instructions, .. } => {
                assert!(instructions.unwrap().contains("127.0.0.1 shop.test"));
            }
            other => panic!("Expected Permission, got {:?}", other),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SYSTEM);
    }
}
