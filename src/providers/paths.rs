//! Key and file-name helpers shared by every adapter.

use chrono::Local;
use rand::Rng;
use std::path::{Path, PathBuf};

use super::ProviderError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Lowercased extension of a file name, without the dot
pub fn extension(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

/// Split a file name into stem and optional extension
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Last path component of a name that may carry client-side directories
pub fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Whether a name's extension is in `allowed` (lowercase, no dots)
pub fn has_allowed_extension(name: &str, allowed: &[String]) -> bool {
    extension(name).is_some_and(|ext| allowed.iter().any(|a| *a == ext))
}

pub fn is_image_name(name: &str) -> bool {
    extension(name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn mime_for(name: &str) -> String {
    mime_guess::from_path(name).first_or_octet_stream().to_string()
}

/// Reduce a base name to `[A-Za-z0-9._-]`. May return an empty string.
pub fn sanitize_base_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Timestamped fallback stem for names that sanitize to nothing
pub fn generated_stem() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}-{:06x}", Local::now().format("%Y%m%d%H%M%S"), suffix)
}

/// Name an upload is stored under.
///
/// `format_ext` replaces the original extension when compression changed the
/// format.
pub fn upload_name(original: &str, format_ext: Option<&str>) -> Result<String, ProviderError> {
    let base = base_name(original.trim());
    if base.is_empty() {
        return Err(ProviderError::InvalidArgument("File name is empty".to_string()));
    }
    let (stem, ext) = split_name(base);
    let mut stem = sanitize_base_name(stem);
    if stem.is_empty() {
        stem = generated_stem();
    }
    let ext = format_ext
        .map(|e| e.to_lowercase())
        .or_else(|| ext.map(|e| sanitize_base_name(&e.to_lowercase())))
        .filter(|e| !e.is_empty());
    Ok(match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    })
}

/// Normalize a caller-supplied directory path relative to a provider root.
///
/// Empty and `.` segments are dropped; `..` is rejected.
pub fn normalize_dir(path: &str) -> Result<String, ProviderError> {
    let mut parts = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment.trim() {
            "" | "." => continue,
            ".." => {
                return Err(ProviderError::InvalidArgument(format!(
                    "Path must not leave the media root: {}",
                    path
                )))
            }
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

/// Join non-empty key segments with `/`
pub fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encode each segment of a key, keeping the slashes
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Public URL of `key` below `base`
pub fn public_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), encode_key(key.trim_start_matches('/')))
}

/// Parent "directory" of a key, empty at the root
pub fn key_dir(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Key with its base name replaced by `new_base`, keeping the old extension.
pub fn renamed_key(old_key: &str, new_base: &str) -> Result<String, ProviderError> {
    let old_name = base_name(old_key);
    let (_, old_ext) = split_name(old_name);

    let requested = base_name(new_base.trim());
    let requested = match (old_ext, split_name(requested)) {
        (Some(old), (stem, Some(ext))) if ext.eq_ignore_ascii_case(old) => stem,
        _ => requested,
    };
    let stem = sanitize_base_name(requested);
    if stem.is_empty() {
        return Err(ProviderError::InvalidArgument("New name is empty".to_string()));
    }
    let name = match old_ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    };
    Ok(join_key(&[key_dir(old_key), &name]))
}

/// Resolve a provider key from an explicit key or a public URL.
///
/// The URL must live under `public_base`; query string and fragment are dropped
/// and the remainder is percent-decoded.
pub fn resolve_key(url: &str, provider_key: Option<&str>, public_base: &str) -> Result<String, ProviderError> {
    if let Some(key) = provider_key.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.trim_start_matches('/').to_string());
    }
    key_from_url(url, public_base)
        .ok_or_else(|| ProviderError::InvalidArgument("No file URL or key given".to_string()))
}

pub fn key_from_url(url: &str, public_base: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let path = match url.strip_prefix(public_base.trim_end_matches('/')) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => url::Url::parse(url).ok()?.path().to_string(),
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    let decoded = urlencoding::decode(path).ok()?;
    let key = decoded.trim_start_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// First free path for `name` in `dir`, adding `-1`, `-2`, ... before the extension
async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

pub async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !exists(&candidate).await {
        return candidate;
    }
    let (stem, ext) = split_name(name);
    let mut n = 1u32;
    loop {
        let next = match ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        let candidate = dir.join(next);
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_sanitize_base_name() {
        assert_eq!(sanitize_base_name("My Holiday Photo"), "My-Holiday-Photo");
        assert_eq!(sanitize_base_name("  a//b??c  "), "a-b-c");
        assert_eq!(sanitize_base_name("..hidden"), "hidden");
        assert_eq!(sanitize_base_name("照片"), "");
        assert_eq!(sanitize_base_name("report_v2.final"), "report_v2.final");
    }

    #[test]
    fn test_upload_name_follows_output_format() {
        assert_eq!(upload_name("Beach Day.JPG", None).unwrap(), "Beach-Day.jpg");
        assert_eq!(upload_name("Beach Day.JPG", Some("webp")).unwrap(), "Beach-Day.webp");
        assert_eq!(upload_name("C:\\Users\\me\\scan.png", None).unwrap(), "scan.png");
        assert!(matches!(upload_name("  ", None), Err(ProviderError::InvalidArgument(_))));
    }

    #[test]
    fn test_upload_name_generates_stem_when_nothing_survives() {
        let name = upload_name("照片.png", None).unwrap();
        let re = Regex::new(r"^\d{14}-[0-9a-f]{6}\.png$").unwrap();
        assert!(re.is_match(&name), "{}", name);
    }

    #[test]
    fn test_normalize_dir() {
        assert_eq!(normalize_dir("/2024//04/./").unwrap(), "2024/04");
        assert_eq!(normalize_dir("").unwrap(), "");
        assert!(normalize_dir("a/../../etc").is_err());
    }

    #[test]
    fn test_renamed_key_keeps_directory_and_extension() {
        assert_eq!(renamed_key("uploads/2024/a.jpg", "new name").unwrap(), "uploads/2024/new-name.jpg");
        assert_eq!(renamed_key("a.jpg", "b.jpg").unwrap(), "b.jpg");
        assert_eq!(renamed_key("a.jpg", "b.png").unwrap(), "b.png.jpg");
        assert!(renamed_key("a.jpg", "???").is_err());
    }

    #[test]
    fn test_key_from_url() {
        let base = "https://cdn.example.com";
        assert_eq!(
            key_from_url("https://cdn.example.com/uploads/My%20Photo.jpg?v=2", base).as_deref(),
            Some("uploads/My Photo.jpg")
        );
        assert_eq!(
            key_from_url("https://other.example.com/x/y.png#frag", base).as_deref(),
            Some("x/y.png")
        );
        assert_eq!(key_from_url("", base), None);
        assert_eq!(key_from_url("https://cdn.example.com/", base), None);
    }

    #[test]
    fn test_public_url_encodes_segments() {
        assert_eq!(
            public_url("https://cdn.example.com/", "/blog/Tom & Jerry.png"),
            "https://cdn.example.com/blog/Tom%20%26%20Jerry.png"
        );
    }

    #[test]
    fn test_resolve_key_prefers_explicit_key() {
        assert_eq!(resolve_key("", Some("/a/b.jpg"), "https://x").unwrap(), "a/b.jpg");
        assert!(matches!(resolve_key("", None, "https://x"), Err(ProviderError::InvalidArgument(_))));
        assert!(matches!(resolve_key(" ", Some(""), "https://x"), Err(ProviderError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unique_path_adds_suffix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.jpg").await, dir.path().join("a.jpg"));
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("a-1.jpg"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "a.jpg").await, dir.path().join("a-2.jpg"));
        std::fs::write(dir.path().join("notes"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "notes").await, dir.path().join("notes-1"));
    }

    #[test]
    fn test_allowed_and_image_checks() {
        let allowed = vec!["jpg".to_string(), "pdf".to_string()];
        assert!(has_allowed_extension("x.JPG", &allowed));
        assert!(!has_allowed_extension("x.exe", &allowed));
        assert!(!has_allowed_extension("jpg", &allowed));
        assert!(is_image_name("a.webp"));
        assert!(!is_image_name("a.pdf"));
        assert_eq!(mime_for("a.png"), "image/png");
    }
}
