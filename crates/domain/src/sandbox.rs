//! Sandbox & URL validator (spec §4.3).
//!
//! Generalizes single-workspace-root path containment into a "descendant
//! of at least one allowed root" check over a configurable list, adds
//! symlink-component rejection, and adds a URL validator that blocks
//! private-network and cloud-metadata targets so a SANDBOXED agent's
//! tools cannot be used to reach internal infrastructure.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};

/// Validate a requested path against a set of allowed roots.
///
/// 1. Expands a leading `~` to `home`.
/// 2. Rejects raw `..` components in the input before any resolution.
/// 3. Canonicalizes the resolved path (rejecting symlink components along
///    the way, since canonicalization follows symlinks transparently —
///    we re-check every ancestor is not itself a symlink after the fact).
/// 4. Requires the canonical result to be a descendant of at least one
///    canonicalized allowed root.
pub fn validate_path(allowed_roots: &[PathBuf], requested: &str, home: &Path) -> Result<PathBuf, String> {
    if allowed_roots.is_empty() {
        return Err("no allowed roots configured; path access denied by default".to_string());
    }

    let expanded = expand_tilde(requested, home);
    let requested_path = Path::new(&expanded);

    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err("path must not contain '..' components".to_string());
        }
    }

    let mut last_err = None;
    for root in allowed_roots {
        match resolve_within(root, requested_path) {
            Ok(resolved) => {
                if has_symlink_component(&resolved, root) {
                    return Err(format!("path '{requested}' traverses a symlink, which is not allowed"));
                }
                return Ok(resolved);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| format!("path '{requested}' is outside all allowed roots")))
}

fn expand_tilde(path: &str, home: &Path) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest).to_string_lossy().into_owned()
    } else if path == "~" {
        home.to_string_lossy().into_owned()
    } else {
        path.to_string()
    }
}

fn resolve_within(root: &Path, requested: &Path) -> Result<PathBuf, String> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| format!("cannot resolve allowed root '{}': {e}", root.display()))?;

    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        canonical_root.join(requested)
    };

    let resolved = canonicalize_best_effort(&candidate)?;

    if !resolved.starts_with(&canonical_root) {
        return Err(format!(
            "path resolves outside allowed root '{}'",
            canonical_root.display()
        ));
    }

    Ok(resolved)
}

/// Canonicalize a path that may not exist yet by walking up to the
/// nearest existing ancestor and re-appending the remaining components.
fn canonicalize_best_effort(candidate: &Path) -> Result<PathBuf, String> {
    if candidate.exists() {
        return candidate
            .canonicalize()
            .map_err(|e| format!("cannot resolve path '{}': {e}", candidate.display()));
    }

    let mut existing = candidate;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name);
                }
                existing = parent;
            }
            None => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| format!("cannot resolve ancestor of '{}': {e}", candidate.display()))?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Check whether any ancestor between `root` and `resolved` (exclusive of
/// `root`) is a symlink. Only meaningful for paths that exist.
fn has_symlink_component(resolved: &Path, root: &Path) -> bool {
    let mut current = resolved.to_path_buf();
    while current != root {
        if let Ok(meta) = std::fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                return true;
            }
        }
        match current.parent() {
            Some(p) => current = p.to_path_buf(),
            None => break,
        }
    }
    false
}

/// Validate a URL a tool wants to reach. Rejects non-http(s) schemes and
/// blocks loopback, RFC1918 private ranges, link-local, and the AWS/GCP
/// cloud-metadata addresses.
pub fn validate_url(url: &str) -> Result<(), String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("scheme '{other}' is not allowed; only http/https")),
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| format!("URL '{url}' has no host"))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(format!("URL host '{host}' resolves to a blocked address"));
        }
    } else if host.eq_ignore_ascii_case("metadata.google.internal") {
        return Err("cloud metadata hostname is blocked".to_string());
    }

    Ok(())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_link_local() || ip.is_private() || ip.is_unspecified() || ip.is_broadcast() {
        return true;
    }
    // 169.254.169.254 — AWS/GCP/Azure cloud metadata endpoint.
    if ip == Ipv4Addr::new(169, 254, 169, 254) {
        return true;
    }
    false
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    // fe80::/10 link-local.
    let segments = ip.segments();
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // fd00::/8 unique local, specifically fd00:ec2::254 (AWS IMDSv6).
    if (segments[0] & 0xff00) == 0xfd00 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_raw_parent_dir_components() {
        let ws = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let err = validate_path(&[ws.path().to_path_buf()], "../escape", home.path()).unwrap_err();
        assert!(err.contains(".."));
    }

    #[test]
    fn accepts_path_within_an_allowed_root() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.txt"), "x").unwrap();
        let home = TempDir::new().unwrap();
        let resolved = validate_path(&[ws.path().to_path_buf()], "a.txt", home.path()).unwrap();
        assert!(resolved.ends_with("a.txt"));
    }

    #[test]
    fn tries_each_allowed_root_in_order() {
        let ws1 = TempDir::new().unwrap();
        let ws2 = TempDir::new().unwrap();
        std::fs::write(ws2.path().join("only_here.txt"), "x").unwrap();
        let home = TempDir::new().unwrap();
        let resolved = validate_path(
            &[ws1.path().to_path_buf(), ws2.path().to_path_buf()],
            "only_here.txt",
            home.path(),
        )
        .unwrap();
        assert!(resolved.starts_with(ws2.path().canonicalize().unwrap()));
    }

    #[test]
    fn no_allowed_roots_denies_by_default() {
        let home = TempDir::new().unwrap();
        assert!(validate_path(&[], "anything.txt", home.path()).is_err());
    }

    #[test]
    fn url_rejects_non_http_scheme() {
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn url_rejects_loopback() {
        assert!(validate_url("http://127.0.0.1/secrets").is_err());
        assert!(validate_url("http://localhost/secrets").is_err());
    }

    #[test]
    fn url_rejects_rfc1918_private_ranges() {
        assert!(validate_url("http://10.0.0.5/").is_err());
        assert!(validate_url("http://192.168.1.1/").is_err());
        assert!(validate_url("http://172.16.0.1/").is_err());
    }

    #[test]
    fn url_rejects_cloud_metadata_address() {
        assert!(validate_url("http://169.254.169.254/latest/meta-data/").is_err());
    }

    #[test]
    fn url_accepts_public_https() {
        assert!(validate_url("https://api.example.com/v1/chat").is_ok());
    }
}
