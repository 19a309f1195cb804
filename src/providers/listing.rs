//! `ListBucketResult` parsing shared by the COS and OSS adapters, plus the
//! conversion of raw object listings into the normalized result shape.

use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::paths;
use super::{FileEntry, FileListResult, FolderEntry, MediaOptions, ProviderError};

/// One object in a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// Unix seconds, 0 when absent or unparseable
    pub mtime: i64,
}

/// One page of a `ListBucketResult`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBucketPage {
    /// `CommonPrefixes/Prefix` values, with their trailing slash
    pub prefixes: Vec<String>,
    pub objects: Vec<ObjectSummary>,
    pub truncated: bool,
    pub next_marker: Option<String>,
}

impl ListBucketPage {
    /// Marker for the next request, if the listing continues.
    ///
    /// Falls back to the last key when a truncated page omits `NextMarker`.
    pub fn continuation(&self) -> Option<String> {
        if !self.truncated {
            return None;
        }
        self.next_marker
            .clone()
            .or_else(|| self.objects.last().map(|o| o.key.clone()))
            .or_else(|| self.prefixes.last().cloned())
    }
}

/// Resolve a predefined entity or a `#NN` / `#xHH` character reference
fn entity(name: &[u8]) -> Option<char> {
    match name {
        b"amp" => Some('&'),
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        [b'#', b'x' | b'X', hex @ ..] => {
            u32::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok().and_then(char::from_u32)
        }
        [b'#', dec @ ..] => std::str::from_utf8(dec).ok()?.parse().ok().and_then(char::from_u32),
        _ => None,
    }
}

pub fn parse_iso8601(value: &str) -> i64 {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

/// Parse a `ListBucketResult` document
pub fn parse_list_bucket(xml: &str) -> Result<ListBucketPage, ProviderError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListBucketPage::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut current: Option<ObjectSummary> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name().as_ref().to_vec();
                if name == b"Contents" {
                    current = Some(ObjectSummary { key: String::new(), size: 0, mtime: 0 });
                }
                stack.push(name);
                text.clear();
            }
            Ok(Event::Text(ref e)) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(ref e)) => {
                match entity(e.as_ref()) {
                    Some(c) => text.push(c),
                    None => {
                        text.push('&');
                        text.push_str(&String::from_utf8_lossy(e.as_ref()));
                        text.push(';');
                    }
                }
            }
            Ok(Event::End(_)) => {
                let name = stack.pop().unwrap_or_default();
                let parent = stack.last().map(|p| p.as_slice());
                let value = std::mem::take(&mut text);
                match (name.as_slice(), parent) {
                    (b"Contents", _) => {
                        if let Some(object) = current.take() {
                            if !object.key.is_empty() {
                                page.objects.push(object);
                            }
                        }
                    }
                    (b"Key", Some(b"Contents")) => {
                        if let Some(ref mut object) = current {
                            object.key = value;
                        }
                    }
                    (b"Size", Some(b"Contents")) => {
                        if let Some(ref mut object) = current {
                            object.size = value.trim().parse().unwrap_or(0);
                        }
                    }
                    (b"LastModified", Some(b"Contents")) => {
                        if let Some(ref mut object) = current {
                            object.mtime = parse_iso8601(&value);
                        }
                    }
                    (b"Prefix", Some(b"CommonPrefixes")) => {
                        if !value.is_empty() {
                            page.prefixes.push(value);
                        }
                    }
                    (b"IsTruncated", Some(b"ListBucketResult")) => {
                        page.truncated = value.trim().eq_ignore_ascii_case("true");
                    }
                    (b"NextMarker", Some(b"ListBucketResult")) => {
                        if !value.is_empty() {
                            page.next_marker = Some(value);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::ParseError(format!(
                    "Invalid listing XML at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}

/// Build the normalized listing for the directory `dir_key` (full key, no trailing slash).
///
/// `root` is the configured prefix folder paths are reported relative to.
/// `url_for` and `thumbnail_for` map an object key to its public and
/// thumbnail URLs. Files are sorted newest first.
pub fn bucket_listing<U, T>(
    pages: &[ListBucketPage],
    root: &str,
    dir_key: &str,
    options: &MediaOptions,
    url_for: U,
    thumbnail_for: T,
) -> FileListResult
where
    U: Fn(&str) -> String,
    T: Fn(&str) -> String,
{
    let mut result = FileListResult::default();
    let root = root.trim_matches('/');

    for page in pages {
        for prefix in &page.prefixes {
            let full = prefix.trim_end_matches('/');
            let name = paths::base_name(full);
            if name.is_empty() || full == dir_key {
                continue;
            }
            let relative = full
                .strip_prefix(root)
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or(full);
            result.folders.push(FolderEntry {
                name: name.to_string(),
                path: relative.to_string(),
            });
        }

        for object in &page.objects {
            // Directory placeholders
            if object.key.ends_with('/') || object.key == dir_key {
                continue;
            }
            let name = paths::base_name(&object.key);
            if !options.is_allowed(name) {
                continue;
            }
            let url = url_for(&object.key);
            let thumbnail_url = paths::is_image_name(name).then(|| thumbnail_for(&url));
            result.files.push(FileEntry {
                name: name.to_string(),
                url,
                thumbnail_url,
                size_bytes: object.size,
                mtime: object.mtime,
                provider_key: Some(object.key.clone()),
            });
        }
    }

    result.sort_by_mtime_desc();
    result
}
