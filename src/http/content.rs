//! Message bodies and uploaded resources.

use crate::{
    errors::ErrorKind,
    http::types::{slice_to_usize, HeaderMap},
};
use std::{borrow::Cow, path::PathBuf};

/// One multipart part or uploaded file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    /// Part headers (`Content-Disposition`, `Content-Type`, ...).
    pub headers: HeaderMap,
    /// File holding the part when it is not kept in memory.
    pub path: PathBuf,
    /// Part bytes when `is_in_memory` is set.
    pub contents: Vec<u8>,
    /// Declared `Content-Type`.
    pub kind: String,
    /// Original file name from `filename="..."`.
    pub name: String,
    /// Form field name from `name="..."`.
    pub key: String,
    pub length: usize,
    /// In-memory parts are never removed from disk on cleanup.
    pub is_in_memory: bool,
}

impl Resource {
    /// A form field held in memory.
    pub fn from_memory(key: &str, contents: impl Into<Vec<u8>>) -> Self {
        let contents = contents.into();
        Self {
            key: key.to_owned(),
            length: contents.len(),
            contents,
            is_in_memory: true,
            ..Self::default()
        }
    }

    /// A file part streamed from disk; `length` is filled when sent.
    pub fn from_file(key: &str, path: impl Into<PathBuf>, kind: &str) -> Self {
        let path = path.into();
        Self {
            key: key.to_owned(),
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            kind: kind.to_owned(),
            ..Self::default()
        }
    }

    /// Part bytes as text when held in memory.
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.contents)
    }
}

/// Body of a request or a response.
///
/// `offset` counts decoded body bytes consumed so far and `prefetch` the
/// bytes already read ahead from the socket that still wait for
/// processing. A body is finalized once nothing more is expected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentFrame {
    pub data: Vec<u8>,
    pub resources: Vec<Resource>,
    /// Declared body length; meaningful when `limited`.
    pub length: usize,
    pub offset: usize,
    pub prefetch: usize,
    /// A definite length is known (`Content-Length`, or a chunked body
    /// whose terminal chunk was seen).
    pub limited: bool,
    /// The declared body is larger than the configured maximum.
    pub exceeds: bool,
}

impl ContentFrame {
    /// Reads the framing headers and primes the frame for a new body.
    ///
    /// `prefetch` is the number of body bytes already buffered after the
    /// header block.
    pub fn prepare(
        &mut self,
        headers: &HeaderMap,
        prefetch: usize,
        max_size: usize,
    ) -> Result<(), ErrorKind> {
        self.offset = 0;
        self.exceeds = false;

        if headers.has_token("Transfer-Encoding", "chunked") {
            self.length = 0;
            self.limited = false;
            self.prefetch = prefetch;
            return Ok(());
        }

        self.length = match headers.get("Content-Length") {
            Some(value) => slice_to_usize(value.trim().as_bytes())
                .ok_or(ErrorKind::InvalidContentLength)?,
            None => 0,
        };
        self.limited = true;
        self.prefetch = prefetch.min(self.length);

        if self.length > max_size {
            self.exceeds = true;
            return Err(ErrorKind::PayloadTooLarge);
        }
        Ok(())
    }

    /// True once no more body bytes are expected. Pending `prefetch`
    /// always means more processing is due.
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.prefetch == 0 && self.limited && self.offset >= self.length
    }

    /// Marks a chunked body as complete after its terminal chunk.
    #[inline]
    pub(crate) fn finalize(&mut self) {
        self.length = self.offset;
        self.limited = true;
        self.prefetch = 0;
    }

    /// Replaces the in-memory body.
    pub fn assign(&mut self, data: impl Into<Vec<u8>>) {
        self.data = data.into();
        self.length = self.data.len();
        self.limited = true;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        self.length = self.data.len();
        self.limited = true;
    }

    /// In-memory body as text.
    pub fn get_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Looks a resource up by its form key.
    pub fn get_resource(&self, key: &str) -> Option<&Resource> {
        self.resources.iter().find(|resource| resource.key == key)
    }

    /// Forgets the body and removes every on-disk resource file.
    pub fn cleanup(&mut self) {
        for resource in self.resources.drain(..) {
            if !resource.is_in_memory && !resource.path.as_os_str().is_empty() {
                if let Err(err) = std::fs::remove_file(&resource.path) {
                    tracing::trace!(path = %resource.path.display(), %err, "resource already gone");
                }
            }
        }

        self.data.clear();
        self.length = 0;
        self.offset = 0;
        self.prefetch = 0;
        self.limited = false;
        self.exceeds = false;
    }
}
