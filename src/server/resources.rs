//! Filesystem facts about served resources: metadata, validators,
//! visibility and content coding.

use crate::{
    errors::ErrorKind,
    http::request::RequestFrame,
    router::entry::RouterEntry,
    server::{
        paths,
        utils::{self, Encoding},
    },
};
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression as Level,
};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// Metadata of a file or directory about to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl ResourceInfo {
    /// Weak validator built from modification time and size.
    pub fn etag(&self) -> String {
        let seconds = self
            .modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |time| time.as_secs());
        format!("\"{seconds:x}-{:x}\"", self.size)
    }

    #[inline]
    pub fn last_modified(&self) -> String {
        utils::http_date(self.modified)
    }
}

/// Stats `path`; missing entries are [`ErrorKind::NotFound`].
pub async fn resource_info(path: &Path) -> Result<ResourceInfo, ErrorKind> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ErrorKind::NotFound),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => return Err(ErrorKind::Forbidden),
        Err(err) => return Err(err.into()),
    };

    Ok(ResourceInfo {
        path: path.to_path_buf(),
        size: metadata.len(),
        modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        is_dir: metadata.is_dir(),
    })
}

/// Whether the route hides `location`: matched against the whole
/// location and against every segment, so hidden directories hide
/// their contents too.
pub fn is_hidden(entry: &RouterEntry, location: &str) -> bool {
    entry.hidden_files.iter().any(|regex| {
        regex.is_match(location)
            || location
                .split('/')
                .filter(|segment| !segment.is_empty())
                .any(|segment| regex.is_match(segment))
    })
}

/// The first configured index file present in `directory`.
pub async fn find_indexed(entry: &RouterEntry, directory: &Path) -> Option<ResourceInfo> {
    for name in &entry.index_files {
        if let Ok(info) = resource_info(&directory.join(name)).await {
            if !info.is_dir {
                return Some(info);
            }
        }
    }
    None
}

/// The first `try_files` candidate that exists, with `$uri` replaced by
/// the request location. A candidate starting with `=` is a status code
/// (`=404`) and ends the search.
pub async fn try_files(entry: &RouterEntry, location: &str) -> Result<Option<ResourceInfo>, ErrorKind> {
    for candidate in &entry.try_files {
        if let Some(code) = candidate.strip_prefix('=') {
            return match code.trim() {
                "403" => Err(ErrorKind::Forbidden),
                _ => Err(ErrorKind::NotFound),
            };
        }

        let location = candidate.replace("$uri", location);
        let path = paths::construct(&entry.files_directory, &location)?;
        if let Ok(info) = resource_info(&path).await {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// Whether the client's copy is stale. `false` means `304 Not Modified`.
///
/// `If-None-Match` wins over `If-Modified-Since` when both are present.
pub fn is_modified(request: &RequestFrame, info: &ResourceInfo) -> bool {
    let tags = request.headers.get_all("If-None-Match");
    if !tags.is_empty() {
        let etag = info.etag();
        return !tags
            .iter()
            .map(|tag| tag.trim().trim_start_matches("W/"))
            .any(|tag| tag == "*" || tag == etag);
    }

    match request.get_header("If-Modified-Since").and_then(|value| utils::parse_http_date(&value)) {
        Some(since) => truncate_seconds(info.modified) > since,
        None => true,
    }
}

/// Whether ranges may be served: without `If-Range`, or when it still
/// names the current representation.
#[inline]
pub fn is_range_valid(request: &RequestFrame, info: &ResourceInfo) -> bool {
    if_range_matches(request, Some(&info.etag()), Some(info.modified))
}

/// `If-Range` check against the validators of a representation; a
/// missing validator never matches.
pub fn if_range_matches(request: &RequestFrame, etag: Option<&str>, modified: Option<SystemTime>) -> bool {
    let Some(value) = request.get_header("If-Range") else {
        return true;
    };

    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return etag.is_some_and(|etag| etag.trim() == value);
    }

    match (utils::parse_http_date(value), modified) {
        (Some(date), Some(modified)) => truncate_seconds(modified) <= date,
        _ => false,
    }
}

#[inline]
fn truncate_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + std::time::Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}

/// The coding to apply to a body of `length` bytes and type `kind`, or
/// `None` to send it as is.
pub fn compressed(
    entry: &RouterEntry,
    request: &RequestFrame,
    path: Option<&Path>,
    kind: &str,
    length: u64,
) -> Option<Encoding> {
    let compression = &entry.compression;
    if !compression.enabled || length < compression.min_length as u64 {
        return None;
    }

    let eligible = match (&compression.files[..], path) {
        ([], _) => utils::is_text_mime(kind),
        (patterns, Some(path)) => {
            let name = path.to_string_lossy();
            patterns.iter().any(|regex| regex.is_match(&name))
        }
        (_, None) => utils::is_text_mime(kind),
    };

    match eligible {
        true => utils::accepted_encoding(request),
        false => None,
    }
}

/// Incremental content coding of a streamed body.
pub trait Encode {
    /// Codes `data`, returning whatever output is ready.
    fn update(&mut self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Flushes the trailer and returns the remaining output.
    fn finish(self) -> io::Result<Vec<u8>>;
}

/// Streaming gzip/zlib compressor; output is drained after each write.
pub enum Compressor {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip(_) => f.write_str("Compressor::Gzip"),
            Self::Deflate(_) => f.write_str("Compressor::Deflate"),
        }
    }
}

impl Compressor {
    pub fn new(encoding: Encoding, level: u32) -> Self {
        let level = Level::new(level.min(9));
        match encoding {
            Encoding::Gzip => Self::Gzip(GzEncoder::new(Vec::new(), level)),
            Encoding::Deflate => Self::Deflate(ZlibEncoder::new(Vec::new(), level)),
        }
    }
}

impl Encode for Compressor {
    fn update(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(encoder) => {
                encoder.write_all(data)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Self::Deflate(encoder) => {
                encoder.write_all(data)?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(encoder) => encoder.finish(),
            Self::Deflate(encoder) => encoder.finish(),
        }
    }
}

/// One-shot compression of an in-memory body; `None` on any failure.
pub fn compress(data: &[u8], encoding: Encoding, level: u32) -> Option<Vec<u8>> {
    let mut compressor = Compressor::new(encoding, level);
    let mut output = compressor.update(data).ok()?;
    output.extend(compressor.finish().ok()?);
    Some(output)
}
