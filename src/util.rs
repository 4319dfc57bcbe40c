//! Shared name and domain helpers.

use crate::errors::{DashboardError, DashboardResult};

/// Longest accepted project name.
pub const MAX_PROJECT_NAME_LEN: usize = 64;

/// Turn free text into a project-name slug.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Project names are slugs: `[a-z0-9][a-z0-9-_]*`, at most 64 bytes.
pub fn validate_project_name(name: &str) -> DashboardResult<()> {
    if name.is_empty() {
        return Err(DashboardError::Validation("Project name is required".into()));
    }
    if name.len() > MAX_PROJECT_NAME_LEN {
        return Err(DashboardError::Validation(format!(
            "Project name must be at most {} characters",
            MAX_PROJECT_NAME_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !first_ok || !rest_ok {
        return Err(DashboardError::Validation(format!(
            "Invalid project name '{}': use lowercase letters, digits, '-' and '_' (try '{}')",
            name,
            slugify(name, MAX_PROJECT_NAME_LEN)
        )));
    }
    Ok(())
}

/// Hostnames for the hosts file and proxy: dot-separated labels of
/// `[a-z0-9-]`, no leading or trailing hyphen.
pub fn validate_domain(domain: &str) -> DashboardResult<()> {
    let invalid = || DashboardError::Validation(format!("Invalid domain '{}'", domain));
    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Strip an optional `:port` suffix and lowercase a `Host` header value.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("My Shop", 64), "my-shop");
        assert_eq!(slugify("  Hello,  World!! ", 64), "hello-world");
        assert_eq!(slugify("snake_case ok", 64), "snake_case-ok");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_hyphen() {
        assert_eq!(slugify("abc def ghi", 4), "abc");
    }

    #[test]
    fn test_validate_project_name() {
        assert!(validate_project_name("demo").is_ok());
        assert!(validate_project_name("my-shop_2").is_ok());
        assert!(validate_project_name("9lives").is_ok());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("-leading").is_err());
        assert!(validate_project_name("Upper").is_err());
        assert!(validate_project_name("../escape").is_err());
        assert!(validate_project_name("has space").is_err());
        assert!(validate_project_name(&"a".repeat(65)).is_err());
        assert!(validate_project_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_invalid_name_suggests_slug() {
        let err = validate_project_name("My Shop").unwrap_err();
        assert!(err.to_string().contains("my-shop"));
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("shop.test").is_ok());
        assert!(validate_domain("api.my-shop.local").is_ok());
        assert!(validate_domain("localhost").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("bad domain").is_err());
        assert!(validate_domain("-x.test").is_err());
        assert!(validate_domain("a..b").is_err());
        assert!(validate_domain("UPPER.test").is_err());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Shop.Test:8090"), "shop.test");
        assert_eq!(normalize_host("shop.test"), "shop.test");
        assert_eq!(normalize_host("shop.test."), "shop.test");
    }
}
