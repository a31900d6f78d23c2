//! Shared CLI argument parsers.

use vmchain::vm::specs::{MemorySize, VmMount};

/// Parse a size such as "512M", "1.5G" or "1073741824".
pub fn parse_size(s: &str) -> Result<MemorySize, String> {
    s.parse().map_err(|e: vmchain::Error| e.to_string())
}

/// Parse a mount specification.
///
/// Format: `host_path:guest_path`
pub fn parse_mount(spec: &str) -> Result<(String, VmMount), String> {
    let (source, target) = spec
        .split_once(':')
        .ok_or_else(|| format!("invalid mount '{}': expected host_path:guest_path", spec))?;
    if source.is_empty() || target.is_empty() {
        return Err(format!("invalid mount '{}': empty path", spec));
    }
    if !target.starts_with('/') {
        return Err(format!("invalid mount '{}': guest path must be absolute", spec));
    }
    Ok((target.to_string(), VmMount::new(source)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2G").unwrap(), MemorySize::from_gib(2));
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_mount() {
        let (target, mount) = parse_mount("/home/me/src:/srv/src").unwrap();
        assert_eq!(target, "/srv/src");
        assert_eq!(mount.source_path, "/home/me/src");
        assert!(parse_mount("/only/host").is_err());
        assert!(parse_mount("/host:relative").is_err());
    }
}
