//! Tenant path to object key mapping.
//!
//! Pure and deterministic, no I/O. Every key this module produces lives
//! under `users/{tenant}/`; any relative path that would resolve outside the
//! tenant root fails with `InvalidPath` before a single store call is made.

use crate::errors::{DriveError, DriveResult};

const TENANT_ROOT: &str = "users";

/// Key prefix under which every object of `tenant` lives.
pub fn tenant_root(tenant: &str) -> DriveResult<String> {
    ensure_tenant(tenant)?;
    Ok(format!("{TENANT_ROOT}/{tenant}/"))
}

/// Map a tenant-relative file path to its object key.
///
/// Leading slashes are stripped, empty and `.` segments collapse, `..` is
/// rejected outright. The relative path must name a file, so it cannot be
/// empty.
pub fn object_key(tenant: &str, relative: &str) -> DriveResult<String> {
    let segments = normalize(relative)?;
    if segments.is_empty() {
        return Err(DriveError::InvalidPath("empty file path".into()));
    }
    Ok(format!("{}{}", tenant_root(tenant)?, segments.join("/")))
}

/// Map a tenant-relative folder path to its prefix key (trailing slash
/// guaranteed). An empty relative path names the tenant root itself.
pub fn folder_key(tenant: &str, relative: &str) -> DriveResult<String> {
    let segments = normalize(relative)?;
    let root = tenant_root(tenant)?;
    if segments.is_empty() {
        return Ok(root);
    }
    Ok(format!("{}{}/", root, segments.join("/")))
}

fn ensure_tenant(tenant: &str) -> DriveResult<()> {
    if tenant.is_empty()
        || tenant.contains('/')
        || tenant.contains("..")
        || tenant.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(DriveError::InvalidPath(format!(
            "invalid tenant id `{tenant}`"
        )));
    }
    Ok(())
}

fn normalize(relative: &str) -> DriveResult<Vec<&str>> {
    if relative
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(DriveError::InvalidPath(relative.to_string()));
    }
    let mut segments = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(DriveError::InvalidPath(relative.to_string())),
            other => segments.push(other),
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriveError;

    #[test]
    fn keys_are_tenant_scoped() {
        assert_eq!(object_key("u1", "a.txt").unwrap(), "users/u1/a.txt");
        assert_eq!(
            object_key("u1", "photos/cat.jpg").unwrap(),
            "users/u1/photos/cat.jpg"
        );
        assert_eq!(folder_key("u1", "photos").unwrap(), "users/u1/photos/");
        assert_eq!(folder_key("u1", "photos/").unwrap(), "users/u1/photos/");
        assert_eq!(folder_key("u1", "").unwrap(), "users/u1/");
    }

    #[test]
    fn slashes_and_dot_segments_collapse() {
        assert_eq!(object_key("u1", "/a//b/./c.txt").unwrap(), "users/u1/a/b/c.txt");
    }

    #[test]
    fn parent_traversal_is_rejected() {
        for path in ["../other", "a/../../b", "..", "photos/../../u2/x"] {
            assert!(matches!(
                object_key("u1", path),
                Err(DriveError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn bad_tenants_are_rejected() {
        for tenant in ["", "a/b", "..", "a\\b"] {
            assert!(matches!(
                folder_key(tenant, "x"),
                Err(DriveError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn produced_keys_never_escape_the_root() {
        for (tenant, path) in [("u1", "a.txt"), ("u1", "x//y/z"), ("t-2", "deep/ly/nested")] {
            let key = object_key(tenant, path).unwrap();
            assert!(key.starts_with(&format!("users/{tenant}/")));
            assert!(!key.contains(".."));
        }
    }

    #[test]
    fn empty_file_path_is_invalid() {
        assert!(matches!(object_key("u1", "//"), Err(DriveError::InvalidPath(_))));
    }
}
