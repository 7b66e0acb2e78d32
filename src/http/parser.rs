//! Incremental HTTP/1.x parsing over partial buffers.
//!
//! Every entry point is restartable: callers keep appending bytes to
//! their buffer and call again. Results use a tri-state contract:
//! `Err(_)` is fatal for the connection, `Ok(Progress::Partial)` asks for
//! more input, and `Ok(Progress::Complete(n))` reports the bytes consumed.

use crate::{
    errors::ErrorKind,
    http::{
        content::Resource,
        query,
        request::RequestFrame,
        response::{Cookie, ResponseFrame},
        types::{slice_to_usize, HeaderMap, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::memchr;
use std::{fs::File, io::Write, path::PathBuf};

/// Outcome of an incremental parse step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<T> {
    Complete(T),
    Partial,
}

/// Outcome of a chunked decoding step.
///
/// Decoded bytes always sit at the front of the buffer handed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunked {
    /// More input is needed; `decoded` bytes are ready.
    Partial { decoded: usize },
    /// The terminal chunk and trailer were consumed. The `leftover` bytes
    /// that follow the body sit right after the decoded ones.
    Complete { decoded: usize, leftover: usize },
}

/// Per-connection parsing state.
#[derive(Debug)]
pub struct Parser {
    max_header_size: usize,
    header_count: usize,
    chunked: ChunkedDecoder,
    multipart: Option<Box<MultipartDecoder>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(&ReqLimits::default())
    }
}

impl Parser {
    pub fn new(limits: &ReqLimits) -> Self {
        Self {
            max_header_size: limits.max_header_size,
            header_count: limits.header_count,
            chunked: ChunkedDecoder::default(),
            multipart: None,
        }
    }

    /// Primes the chunked decoder for a new body.
    #[inline]
    pub fn prepare_for_chunked(&mut self) {
        self.chunked = ChunkedDecoder::default();
    }

    /// Primes the multipart decoder for a new body.
    ///
    /// Parts go to files under `temp_dir`; plain fields, `skip`, or the
    /// absence of a directory keep them in memory.
    pub fn prepare_for_multipart(
        &mut self,
        boundary: &str,
        temp_dir: Option<PathBuf>,
        skip: bool,
        max_resources: usize,
    ) {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());

        self.multipart = Some(Box::new(MultipartDecoder {
            lookbehind: vec![0; marker.len() + 2],
            boundary: marker,
            index: 0,
            state: PartState::Start,
            field: Vec::new(),
            value: Vec::new(),
            current: None,
            file: None,
            temp_dir,
            skip,
            max_resources,
            count: 0,
        }));
    }

    /// Resets everything between pipelined messages.
    pub fn prepare_for_next(&mut self) {
        self.prepare_for_chunked();
        if let Some(mut decoder) = self.multipart.take() {
            decoder.abort();
        }
    }

    /// Looks for the end of the header block (`CRLF CRLF` or bare `LF LF`).
    ///
    /// `offset` is how much of `buffer` was scanned by a previous call;
    /// the last three of those bytes are scanned again because a
    /// terminator may straddle two reads. Returns the index right after
    /// the terminator.
    pub fn is_completed(buffer: &[u8], offset: usize) -> Option<usize> {
        let mut position = offset.saturating_sub(3);

        while let Some(found) = memchr(b'\n', buffer.get(position..)?) {
            let lf = position + found;
            match (buffer.get(lf + 1), buffer.get(lf + 2)) {
                (Some(b'\n'), _) => return Some(lf + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(lf + 3),
                _ => position = lf + 1,
            }
        }
        None
    }

    /// Parses the request line and headers once the block is complete.
    pub fn parse_request(
        &mut self,
        buffer: &[u8],
        offset: usize,
        request: &mut RequestFrame,
    ) -> Result<Progress<usize>, ErrorKind> {
        let end = match self.header_block_end(buffer, offset)? {
            Progress::Complete(end) => end,
            Progress::Partial => return Ok(Progress::Partial),
        };

        let mut position = 0;
        while position < end && matches!(buffer[position], b'\r' | b'\n') {
            position += 1;
        }

        let (line_end, next) =
            tokenize(&buffer[..end], position)?.ok_or(ErrorKind::InvalidRequestLine)?;
        Self::process_request(&buffer[position..line_end], request)?;

        self.process_headers(
            &buffer[..end],
            next,
            &mut request.headers,
            Some(&mut request.cookies),
        )?;

        tracing::trace!(method = request.method.as_str(), location = %request.location, "request head parsed");
        Ok(Progress::Complete(end))
    }

    /// Parses the status line and headers once the block is complete.
    ///
    /// `Set-Cookie` lines are moved into `response.cookies`.
    pub fn parse_response(
        &mut self,
        buffer: &[u8],
        offset: usize,
        response: &mut ResponseFrame,
    ) -> Result<Progress<usize>, ErrorKind> {
        let end = match self.header_block_end(buffer, offset)? {
            Progress::Complete(end) => end,
            Progress::Partial => return Ok(Progress::Partial),
        };

        let (line_end, next) =
            tokenize(&buffer[..end], 0)?.ok_or(ErrorKind::InvalidStatusLine)?;
        Self::process_response(&buffer[..line_end], response)?;

        self.process_headers(&buffer[..end], next, &mut response.headers, None)?;
        if let Some(values) = response.headers.remove("Set-Cookie") {
            for value in values {
                if let Some(cookie) = Cookie::parse(&value) {
                    response.set_cookie(cookie);
                }
            }
        }

        Ok(Progress::Complete(end))
    }

    #[inline]
    fn header_block_end(&self, buffer: &[u8], offset: usize) -> Result<Progress<usize>, ErrorKind> {
        match Self::is_completed(buffer, offset) {
            Some(end) if end > self.max_header_size => Err(ErrorKind::HeadersTooLarge),
            Some(end) => Ok(Progress::Complete(end)),
            None if buffer.len() > self.max_header_size => Err(ErrorKind::HeadersTooLarge),
            None => Ok(Progress::Partial),
        }
    }

    fn process_request(line: &[u8], request: &mut RequestFrame) -> Result<(), ErrorKind> {
        let mut parts = line.splitn(3, |&byte| byte == b' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ErrorKind::InvalidRequestLine);
        };

        request.method = Method::from_bytes(method)?;
        request.version = Version::from_bytes(version)?;

        let target: &[u8] = match target {
            [b'/', ..] => target,
            b"*" if request.method == Method::Options => target,
            _ => strip_authority(target).ok_or(ErrorKind::InvalidUrl)?,
        };

        let (path, query) = match memchr(b'?', target) {
            Some(index) => (&target[..index], &target[index + 1..]),
            None => (target, &b""[..]),
        };

        request.location = query::decode(path, false).map_err(|_| ErrorKind::InvalidUrl)?;
        request.referrer.clone_from(&request.location);
        request.query = simdutf8::basic::from_utf8(query)
            .map_err(|_| ErrorKind::InvalidUrl)?
            .to_owned();
        Ok(())
    }

    fn process_response(line: &[u8], response: &mut ResponseFrame) -> Result<(), ErrorKind> {
        let mut parts = line.splitn(3, |&byte| byte == b' ');
        let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(ErrorKind::InvalidStatusLine);
        };

        response.version = Version::from_bytes(version)?;
        response.status_code = match code.len() {
            3 => slice_to_usize(code).map(|code| code as u16),
            _ => None,
        };
        if response.status_code.is_none() {
            return Err(ErrorKind::InvalidStatusLine);
        }
        Ok(())
    }

    /// Parses `Name: value` lines from `position` up to the empty line.
    ///
    /// With `cookies` present, `Cookie` headers are split into pairs
    /// there. Other values containing commas are split into several
    /// values, except for headers whose syntax embeds commas.
    pub fn process_headers(
        &self,
        buffer: &[u8],
        mut position: usize,
        headers: &mut HeaderMap,
        mut cookies: Option<&mut HeaderMap>,
    ) -> Result<(), ErrorKind> {
        let mut count = 0;

        loop {
            let (line_end, next) = tokenize(buffer, position)?.ok_or(ErrorKind::InvalidHeader)?;
            if line_end == position {
                return Ok(());
            }

            count += 1;
            if count > self.header_count {
                return Err(ErrorKind::TooManyHeaders);
            }

            let line = &buffer[position..line_end];
            let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
            let name = &line[..colon];
            if name.is_empty() || !name.iter().all(|&byte| is_token(byte)) {
                return Err(ErrorKind::InvalidHeader);
            }

            // Token bytes are ASCII.
            let name = simdutf8::basic::from_utf8(name).map_err(|_| ErrorKind::InvalidHeader)?;
            let value = simdutf8::basic::from_utf8(trim_ows(&line[colon + 1..]))
                .map_err(|_| ErrorKind::InvalidHeader)?;

            match cookies.as_deref_mut() {
                Some(cookies) if name.eq_ignore_ascii_case("cookie") => {
                    for pair in value.split(';') {
                        if let Some((key, value)) = pair.split_once('=') {
                            cookies.append(key.trim(), value.trim());
                        }
                    }
                }
                _ if !value.contains(',') || keeps_commas(name) => headers.append(name, value),
                _ => {
                    for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
                        headers.append(name, item);
                    }
                }
            }

            position = next;
        }
    }

    /// Decodes a chunked body in place; see [`Chunked`].
    #[inline]
    pub fn parse_decode_chunked(&mut self, buffer: &mut [u8]) -> Result<Chunked, ErrorKind> {
        self.chunked.decode(buffer)
    }

    /// Feeds body bytes to the multipart decoder.
    ///
    /// `on_part` runs once per completed resource, then once with `None`
    /// when the closing boundary is seen.
    pub fn multipart_parse<F: FnMut(Option<Resource>)>(
        &mut self,
        buffer: &[u8],
        on_part: F,
    ) -> Result<(), ErrorKind> {
        match self.multipart.as_deref_mut() {
            Some(decoder) => decoder.execute(buffer, on_part),
            None => Err(ErrorKind::InvalidMultipart),
        }
    }

    /// Whether the closing boundary of the current multipart body was seen.
    pub fn is_multipart_finished(&self) -> bool {
        matches!(self.multipart.as_deref(), Some(decoder) if decoder.state == PartState::End)
    }
}

/// Extracts one CRLF or LF terminated line starting at `start`.
///
/// Returns `(line_end, next_line_start)`, or `None` when the terminator
/// is not buffered yet. Runs of plain printable bytes are skipped eight
/// at a time before the byte-wise control character scan.
pub(crate) fn tokenize(buffer: &[u8], start: usize) -> Result<Option<(usize, usize)>, ErrorKind> {
    let mut index = start;

    while let Some(word) = buffer.get(index..index + 8) {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(word);
        if !is_plain_word(u64::from_le_bytes(bytes)) {
            break;
        }
        index += 8;
    }

    while let Some(&byte) = buffer.get(index) {
        match byte {
            b'\n' => return Ok(Some((index, index + 1))),
            b'\r' => {
                return match buffer.get(index + 1) {
                    Some(b'\n') => Ok(Some((index, index + 2))),
                    Some(_) => Err(ErrorKind::InvalidHeader),
                    None => Ok(None),
                }
            }
            b'\t' => index += 1,
            0x00..=0x1f | 0x7f => return Err(ErrorKind::InvalidHeader),
            _ => index += 1,
        }
    }
    Ok(None)
}

const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

/// No byte below 0x20 and no DEL. Bytes >= 0x80 pass.
#[inline(always)]
fn is_plain_word(word: u64) -> bool {
    let below_space = word.wrapping_sub(LO * 0x20) & !word;
    let del = word ^ (LO * 0x7f);
    let is_del = del.wrapping_sub(LO) & !del;

    (below_space | is_del) & HI == 0
}

#[inline(always)]
fn is_token(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

#[inline]
fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// Headers whose grammar uses commas inside a single value.
fn keeps_commas(name: &str) -> bool {
    const NAMES: [&str; 12] = [
        "user-agent",
        "set-cookie",
        "date",
        "expires",
        "last-modified",
        "if-modified-since",
        "if-unmodified-since",
        "if-range",
        "retry-after",
        "authorization",
        "www-authenticate",
        "content-disposition",
    ];

    NAMES.iter().any(|known| known.eq_ignore_ascii_case(name))
}

/// `http://host:port/path` -> `/path`.
fn strip_authority(target: &[u8]) -> Option<&[u8]> {
    let rest = target
        .strip_prefix(b"http://")
        .or_else(|| target.strip_prefix(b"https://"))?;

    match memchr(b'/', rest) {
        Some(index) => Some(&rest[index..]),
        None => Some(b"/"),
    }
}

// CHUNKED

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChunkState {
    #[default]
    Size,
    Ext,
    Data,
    End,
    Head,
    Middle,
}

#[derive(Debug, Default)]
struct ChunkedDecoder {
    state: ChunkState,
    remaining: usize,
    hex_count: usize,
}

impl ChunkedDecoder {
    fn decode(&mut self, buffer: &mut [u8]) -> Result<Chunked, ErrorKind> {
        let len = buffer.len();
        let mut src = 0;
        let mut dst = 0;

        loop {
            match self.state {
                ChunkState::Size => {
                    loop {
                        let Some(&byte) = buffer.get(src) else {
                            return Ok(Chunked::Partial { decoded: dst });
                        };

                        match hex_digit(byte) {
                            Some(digit) => {
                                if self.hex_count == std::mem::size_of::<usize>() * 2 {
                                    return Err(ErrorKind::InvalidChunk);
                                }
                                self.remaining = self.remaining * 16 + digit;
                                self.hex_count += 1;
                                src += 1;
                            }
                            None if self.hex_count == 0 => return Err(ErrorKind::InvalidChunk),
                            None => match byte {
                                b' ' | b'\t' | b';' | b'\n' | b'\r' => break,
                                _ => return Err(ErrorKind::InvalidChunk),
                            },
                        }
                    }
                    self.hex_count = 0;
                    self.state = ChunkState::Ext;
                }
                ChunkState::Ext => {
                    match memchr(b'\n', &buffer[src..]) {
                        Some(found) => src += found + 1,
                        None => return Ok(Chunked::Partial { decoded: dst }),
                    }

                    self.state = match self.remaining {
                        0 => ChunkState::Head,
                        _ => ChunkState::Data,
                    };
                }
                ChunkState::Data => {
                    let available = len - src;
                    if available < self.remaining {
                        buffer.copy_within(src..len, dst);
                        dst += available;
                        self.remaining -= available;
                        return Ok(Chunked::Partial { decoded: dst });
                    }

                    buffer.copy_within(src..src + self.remaining, dst);
                    src += self.remaining;
                    dst += self.remaining;
                    self.remaining = 0;
                    self.state = ChunkState::End;
                }
                ChunkState::End => {
                    while buffer.get(src) == Some(&b'\r') {
                        src += 1;
                    }
                    match buffer.get(src) {
                        None => return Ok(Chunked::Partial { decoded: dst }),
                        Some(b'\n') => src += 1,
                        Some(_) => return Err(ErrorKind::InvalidChunk),
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Head => {
                    while buffer.get(src) == Some(&b'\r') {
                        src += 1;
                    }
                    let Some(&byte) = buffer.get(src) else {
                        return Ok(Chunked::Partial { decoded: dst });
                    };
                    src += 1;

                    if byte == b'\n' {
                        buffer.copy_within(src..len, dst);
                        self.state = ChunkState::Size;
                        return Ok(Chunked::Complete {
                            decoded: dst,
                            leftover: len - src,
                        });
                    }
                    self.state = ChunkState::Middle;
                }
                ChunkState::Middle => {
                    match memchr(b'\n', &buffer[src..]) {
                        Some(found) => src += found + 1,
                        None => return Ok(Chunked::Partial { decoded: dst }),
                    }
                    self.state = ChunkState::Head;
                }
            }
        }
    }
}

#[inline(always)]
fn hex_digit(byte: u8) -> Option<usize> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as usize),
        b'a'..=b'f' => Some((byte - b'a' + 10) as usize),
        b'A'..=b'F' => Some((byte - b'A' + 10) as usize),
        _ => None,
    }
}

// MULTIPART

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartState {
    Start,
    StartBoundary,
    HeaderFieldStart,
    HeaderField,
    HeadersAlmostDone,
    HeaderValueStart,
    HeaderValue,
    HeaderValueAlmostDone,
    PartDataStart,
    PartData,
    PartDataAlmostBoundary,
    PartDataBoundary,
    PartDataAlmostEnd,
    PartDataFinalHyphen,
    PartDataEnd,
    End,
}

#[derive(Debug)]
struct MultipartDecoder {
    /// `--` followed by the boundary parameter.
    boundary: Vec<u8>,
    /// CR, LF and the partially matched boundary, replayed as data on mismatch.
    lookbehind: Vec<u8>,
    index: usize,
    state: PartState,

    field: Vec<u8>,
    value: Vec<u8>,
    current: Option<Resource>,
    file: Option<File>,

    temp_dir: Option<PathBuf>,
    skip: bool,
    max_resources: usize,
    count: usize,
}

impl MultipartDecoder {
    fn execute<F: FnMut(Option<Resource>)>(
        &mut self,
        buffer: &[u8],
        mut on_part: F,
    ) -> Result<(), ErrorKind> {
        let len = buffer.len();
        let mut mark = 0;
        let mut i = 0;

        while i < len {
            let c = buffer[i];
            let is_last = i == len - 1;

            match self.state {
                PartState::Start | PartState::StartBoundary => {
                    if self.state == PartState::Start {
                        self.index = 0;
                        self.state = PartState::StartBoundary;
                    }

                    let boundary_len = self.boundary.len();
                    if self.index == boundary_len {
                        if c != b'\r' {
                            return Err(ErrorKind::InvalidMultipart);
                        }
                        self.index += 1;
                    } else if self.index == boundary_len + 1 {
                        if c != b'\n' {
                            return Err(ErrorKind::InvalidMultipart);
                        }
                        self.index = 0;
                        self.on_part_begin()?;
                        self.state = PartState::HeaderFieldStart;
                    } else {
                        if c != self.boundary[self.index] {
                            return Err(ErrorKind::InvalidMultipart);
                        }
                        self.index += 1;
                    }
                }
                PartState::HeaderFieldStart | PartState::HeaderField => {
                    if self.state == PartState::HeaderFieldStart {
                        mark = i;
                        self.state = PartState::HeaderField;
                    }

                    if c == b'\r' {
                        self.state = PartState::HeadersAlmostDone;
                    } else if c == b':' {
                        self.field.extend_from_slice(&buffer[mark..i]);
                        self.state = PartState::HeaderValueStart;
                    } else if !is_token(c) {
                        return Err(ErrorKind::InvalidMultipart);
                    } else if is_last {
                        self.field.extend_from_slice(&buffer[mark..=i]);
                    }
                }
                PartState::HeadersAlmostDone => {
                    if c != b'\n' {
                        return Err(ErrorKind::InvalidMultipart);
                    }
                    self.state = PartState::PartDataStart;
                }
                PartState::HeaderValueStart | PartState::HeaderValue => {
                    if self.state == PartState::HeaderValueStart {
                        if c == b' ' {
                            i += 1;
                            continue;
                        }
                        mark = i;
                        self.state = PartState::HeaderValue;
                    }

                    if c == b'\r' {
                        self.value.extend_from_slice(&buffer[mark..i]);
                        self.on_header()?;
                        self.state = PartState::HeaderValueAlmostDone;
                    } else if is_last {
                        self.value.extend_from_slice(&buffer[mark..=i]);
                    }
                }
                PartState::HeaderValueAlmostDone => {
                    if c != b'\n' {
                        return Err(ErrorKind::InvalidMultipart);
                    }
                    self.state = PartState::HeaderFieldStart;
                }
                PartState::PartDataStart | PartState::PartData => {
                    if self.state == PartState::PartDataStart {
                        self.on_headers_complete()?;
                        mark = i;
                        self.state = PartState::PartData;
                    }

                    if c == b'\r' {
                        self.on_part_data(&buffer[mark..i])?;
                        mark = i;
                        self.state = PartState::PartDataAlmostBoundary;
                        self.lookbehind[0] = b'\r';
                    } else if is_last {
                        self.on_part_data(&buffer[mark..=i])?;
                    }
                }
                PartState::PartDataAlmostBoundary => {
                    if c == b'\n' {
                        self.state = PartState::PartDataBoundary;
                        self.lookbehind[1] = b'\n';
                        self.index = 0;
                    } else {
                        self.replay_lookbehind(1)?;
                        self.state = PartState::PartData;
                        mark = i;
                        continue;
                    }
                }
                PartState::PartDataBoundary => {
                    if self.boundary[self.index] != c {
                        self.replay_lookbehind(2 + self.index)?;
                        self.state = PartState::PartData;
                        mark = i;
                        continue;
                    }

                    self.lookbehind[2 + self.index] = c;
                    self.index += 1;
                    if self.index == self.boundary.len() {
                        self.on_part_end(&mut on_part)?;
                        self.state = PartState::PartDataAlmostEnd;
                    }
                }
                PartState::PartDataAlmostEnd => match c {
                    b'-' => self.state = PartState::PartDataFinalHyphen,
                    b'\r' => self.state = PartState::PartDataEnd,
                    _ => return Err(ErrorKind::InvalidMultipart),
                },
                PartState::PartDataFinalHyphen => {
                    if c != b'-' {
                        return Err(ErrorKind::InvalidMultipart);
                    }
                    on_part(None);
                    self.state = PartState::End;
                }
                PartState::PartDataEnd => {
                    if c != b'\n' {
                        return Err(ErrorKind::InvalidMultipart);
                    }
                    self.state = PartState::HeaderFieldStart;
                    self.on_part_begin()?;
                }
                PartState::End => {}
            }

            i += 1;
        }

        Ok(())
    }

    fn replay_lookbehind(&mut self, len: usize) -> Result<(), ErrorKind> {
        let replay = std::mem::take(&mut self.lookbehind);
        let result = self.on_part_data(&replay[..len]);
        self.lookbehind = replay;
        result
    }

    fn on_part_begin(&mut self) -> Result<(), ErrorKind> {
        self.count += 1;
        if self.count > self.max_resources {
            return Err(ErrorKind::TooManyResources);
        }

        self.current = Some(Resource::default());
        Ok(())
    }

    fn on_header(&mut self) -> Result<(), ErrorKind> {
        let field = std::mem::take(&mut self.field);
        let value = std::mem::take(&mut self.value);

        let (Ok(field), Ok(value)) = (String::from_utf8(field), String::from_utf8(value)) else {
            return Err(ErrorKind::InvalidMultipart);
        };
        if let Some(resource) = self.current.as_mut() {
            resource.headers.append(&field, &value);
        }
        Ok(())
    }

    fn on_headers_complete(&mut self) -> Result<(), ErrorKind> {
        let Some(resource) = self.current.as_mut() else {
            return Err(ErrorKind::InvalidMultipart);
        };

        if let Some(disposition) = resource.headers.get("Content-Disposition") {
            resource.key = header_param(disposition, "name").unwrap_or_default();
            resource.name = header_param(disposition, "filename").unwrap_or_default();
        }
        resource.kind = resource
            .headers
            .get("Content-Type")
            .unwrap_or_default()
            .to_owned();

        match &self.temp_dir {
            Some(dir) if !self.skip && !resource.name.is_empty() => {
                let path = dir.join(format!("upload-{:016x}", fastrand::u64(..)));
                let file = File::create(&path).map_err(|err| {
                    tracing::warn!(path = %path.display(), %err, "cannot create upload file");
                    ErrorKind::Unprocessable
                })?;

                resource.path = path;
                resource.is_in_memory = false;
                self.file = Some(file);
            }
            _ => resource.is_in_memory = true,
        }
        Ok(())
    }

    fn on_part_data(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(resource) = self.current.as_mut() else {
            return Err(ErrorKind::InvalidMultipart);
        };

        resource.length += data.len();
        match self.file.as_mut() {
            // Synchronous fallback: parts are written from the parsing step.
            Some(file) => file.write_all(data).map_err(|_| ErrorKind::Unprocessable),
            None => {
                resource.contents.extend_from_slice(data);
                Ok(())
            }
        }
    }

    fn on_part_end<F: FnMut(Option<Resource>)>(&mut self, on_part: &mut F) -> Result<(), ErrorKind> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(|_| ErrorKind::Unprocessable)?;
        }
        if let Some(resource) = self.current.take() {
            on_part(Some(resource));
        }
        Ok(())
    }

    /// Drops a half-written part and its file.
    fn abort(&mut self) {
        self.file = None;
        if let Some(resource) = self.current.take() {
            if !resource.is_in_memory && !resource.path.as_os_str().is_empty() {
                let _ = std::fs::remove_file(&resource.path);
            }
        }
    }
}

impl Drop for MultipartDecoder {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Reads `param="value"` out of a parameterized header value
/// (`Content-Disposition`, `Content-Type`).
pub(crate) fn header_param(value: &str, param: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|item| {
        let (key, value) = item.split_once('=')?;
        match key.trim().eq_ignore_ascii_case(param) {
            true => Some(value.trim().trim_matches('"').to_owned()),
            false => None,
        }
    })
}

#[cfg(test)]
mod request_tests {
    use super::*;

    fn parse(src: &str) -> Result<Progress<usize>, ErrorKind> {
        Parser::default().parse_request(src.as_bytes(), 0, &mut RequestFrame::default())
    }

    #[test]
    fn is_completed() {
        #[rustfmt::skip]
        let cases: [(&[u8], usize, Option<usize>); 7] = [
            (b"GET / HTTP/1.1\r\n\r\n",        0,  Some(18)),
            (b"GET / HTTP/1.1\n\n",            0,  Some(16)),
            (b"GET / HTTP/1.1\n\r\n",          0,  Some(17)),
            (b"GET / HTTP/1.1\r\n\r\n",        16, Some(18)),
            (b"GET / HTTP/1.1\r\nA: b\r\n",    0,  None),
            (b"GET / HTTP/1.1\r\n\r",          0,  None),
            (b"",                              5,  None),
        ];

        for (buffer, offset, expected) in cases {
            assert_eq!(Parser::is_completed(buffer, offset), expected);
        }
    }

    #[test]
    fn parse_valid_request() {
        let src = "POST /api/users%20list?sort=name&debug HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Accept: text/html, application/json\r\n\
                   User-Agent: Mozilla/5.0 (X11, Linux)\r\n\
                   If-Modified-Since: Wed, 21 Oct 2015 07:28:00 GMT\r\n\
                   Cookie: sid=42; theme = dark\r\n\
                   X-Empty:\r\n\
                   Content-Length: 4\r\n\r\nbody";

        let mut request = RequestFrame::default();
        let result = Parser::default().parse_request(src.as_bytes(), 0, &mut request);

        assert_eq!(result, Ok(Progress::Complete(src.len() - 4)));
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.version, Version::Http11);
        assert_eq!(request.location, "/api/users list");
        assert_eq!(request.referrer, "/api/users list");
        assert_eq!(request.query, "sort=name&debug");

        assert_eq!(request.headers.get("host"), Some("example.com"));
        assert_eq!(request.headers.get_all("accept").len(), 2);
        assert_eq!(
            request.headers.get("user-agent"),
            Some("Mozilla/5.0 (X11, Linux)")
        );
        assert_eq!(
            request.headers.get("if-modified-since"),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        assert_eq!(request.headers.get("x-empty"), Some(""));
        assert!(!request.headers.contains("cookie"));
        assert_eq!(request.cookies.get("sid"), Some("42"));
        assert_eq!(request.cookies.get("theme"), Some("dark"));
    }

    #[test]
    fn parse_request_lines() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.0\r\n\r\n",                      Ok(Method::Get)),
            ("\r\nDELETE /a HTTP/1.1\r\n\r\n",              Ok(Method::Delete)),
            ("OPTIONS * HTTP/1.1\r\n\r\n",                  Ok(Method::Options)),
            ("GET http://host:8/x HTTP/1.1\r\n\r\n",        Ok(Method::Get)),
            ("BREW / HTTP/1.1\r\n\r\n",                     Err(ErrorKind::InvalidMethod)),
            ("GET / HTTP/2.0\r\n\r\n",                      Err(ErrorKind::UnsupportedVersion)),
            ("GET /\r\n\r\n",                               Err(ErrorKind::InvalidRequestLine)),
            ("GET x HTTP/1.1\r\n\r\n",                      Err(ErrorKind::InvalidUrl)),
            ("GET /%zz HTTP/1.1\r\n\r\n",                   Err(ErrorKind::InvalidUrl)),
            ("GET / HTTP/1.1\r\nNo-Colon\r\n\r\n",          Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",       Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\n: x\r\n\r\n",               Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\nA: \x01\r\n\r\n",           Err(ErrorKind::InvalidHeader)),
            ("GET / HTTP/1.1\r\nA: b\rc\r\n\r\n",           Err(ErrorKind::InvalidHeader)),
        ];

        for (src, expected) in cases {
            let mut request = RequestFrame::default();
            let result = Parser::default().parse_request(src.as_bytes(), 0, &mut request);

            match expected {
                Ok(method) => {
                    assert!(matches!(result, Ok(Progress::Complete(_))), "{src:?}");
                    assert_eq!(request.method, method);
                }
                Err(err) => assert_eq!(result, Err(err), "{src:?}"),
            }
        }
    }

    #[test]
    fn absolute_form() {
        let mut request = RequestFrame::default();
        Parser::default()
            .parse_request(b"GET http://host:8/x/y?q=1 HTTP/1.1\r\n\r\n", 0, &mut request)
            .unwrap();

        assert_eq!(request.location, "/x/y");
        assert_eq!(request.query, "q=1");
    }

    #[test]
    fn limits() {
        let limits = ReqLimits {
            max_header_size: 64,
            header_count: 2,
            ..ReqLimits::default()
        };

        let long = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(100));
        assert_eq!(
            Parser::new(&limits).parse_request(long.as_bytes(), 0, &mut RequestFrame::default()),
            Err(ErrorKind::HeadersTooLarge)
        );

        let unfinished = format!("GET / HTTP/1.1\r\nX: {}", "a".repeat(100));
        assert_eq!(
            Parser::new(&limits).parse_request(unfinished.as_bytes(), 0, &mut RequestFrame::default()),
            Err(ErrorKind::HeadersTooLarge)
        );

        let many = "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        assert_eq!(
            Parser::new(&limits).parse_request(many.as_bytes(), 0, &mut RequestFrame::default()),
            Err(ErrorKind::TooManyHeaders)
        );

        assert_eq!(parse("GET / HTTP/1.1\r\nA: 1\r\n"), Ok(Progress::Partial));
    }

    #[test]
    fn incremental_equivalence() {
        let src = b"PUT /files/a%2Bb.txt?x=1 HTTP/1.1\r\n\
                    Host: localhost:8080\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    Cookie: a=1; b=2\r\n\
                    Accept-Encoding: gzip, deflate\r\n\r\n";

        let mut whole = RequestFrame::default();
        let expected = Parser::default().parse_request(src, 0, &mut whole).unwrap();

        for split in 1..src.len() {
            let mut parser = Parser::default();
            let mut request = RequestFrame::default();

            let mut offset = 0;
            let mut result = Progress::Partial;
            for end in [split, src.len()] {
                result = parser.parse_request(&src[..end], offset, &mut request).unwrap();
                offset = end;
                if result != Progress::Partial {
                    break;
                }
            }

            assert_eq!(result, expected, "split at {split}");
            assert_eq!(request.location, whole.location);
            assert_eq!(request.query, whole.query);
            assert_eq!(request.headers, whole.headers);
            assert_eq!(request.cookies, whole.cookies);
        }
    }

    #[test]
    fn tokenize_fast_path() {
        let line = b"0123456789abcdefghijklmnop\r\nnext";
        assert_eq!(tokenize(line, 0), Ok(Some((26, 28))));
        assert_eq!(tokenize(line, 28), Ok(None));
        assert_eq!(tokenize("héllo wörld, ünïcode\n".as_bytes(), 0).map(|r| r.is_some()), Ok(true));
        assert_eq!(tokenize(b"abcdefgh\x7fijk\r\n", 0), Err(ErrorKind::InvalidHeader));

        assert!(is_plain_word(u64::from_le_bytes(*b"abcdefgh")));
        assert!(!is_plain_word(u64::from_le_bytes(*b"abc\rdefg")));
        assert!(!is_plain_word(u64::from_le_bytes(*b"abcdefg\x7f")));
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;

    #[test]
    fn parse_response() {
        let src = b"HTTP/1.1 206 Partial Content\r\n\
                    Content-Range: bytes 0-9/100\r\n\
                    Set-Cookie: sid=1; Path=/; HttpOnly\r\n\
                    Set-Cookie: sid=2\r\n\
                    Expires: Thu, 01 Dec 1994 16:00:00 GMT\r\n\r\n0123456789";

        let mut response = ResponseFrame::default();
        let result = Parser::default().parse_response(src, 0, &mut response);

        assert_eq!(result, Ok(Progress::Complete(src.len() - 10)));
        assert_eq!(response.status_code, Some(206));
        assert_eq!(response.headers.get("content-range"), Some("bytes 0-9/100"));
        assert_eq!(response.headers.get("expires"), Some("Thu, 01 Dec 1994 16:00:00 GMT"));
        assert!(!response.headers.contains("set-cookie"));
        assert_eq!(response.cookies.len(), 1);
        assert_eq!(response.cookies[0].value, "2");
    }

    #[test]
    fn invalid_status_lines() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.1 20 OK\r\n\r\n",   Err(ErrorKind::InvalidStatusLine)),
            ("HTTP/1.1 abc OK\r\n\r\n",  Err(ErrorKind::InvalidStatusLine)),
            ("HTTP/1.1\r\n\r\n",         Err(ErrorKind::InvalidStatusLine)),
            ("HTTP/3 200 OK\r\n\r\n",    Err(ErrorKind::UnsupportedVersion)),
            ("HTTP/1.0 204\r\n\r\n",     Ok(204)),
        ];

        for (src, expected) in cases {
            let mut response = ResponseFrame::default();
            let result = Parser::default().parse_response(src.as_bytes(), 0, &mut response);

            match expected {
                Ok(code) => {
                    assert!(result.is_ok());
                    assert_eq!(response.status_code, Some(code));
                }
                Err(err) => assert_eq!(result, Err(err)),
            }
        }
    }
}


#[cfg(test)]
mod multipart_tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        hello\r\n--world\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        file\r\ncontents\r\n\
        --XyZ--\r\n";

    fn run(pieces: &[&[u8]], temp_dir: Option<PathBuf>) -> Result<(Vec<Resource>, bool), ErrorKind> {
        let mut parser = Parser::default();
        parser.prepare_for_multipart("XyZ", temp_dir, false, 10);

        let mut resources = Vec::new();
        let mut finished = false;
        for piece in pieces {
            parser.multipart_parse(piece, |part| match part {
                Some(resource) => resources.push(resource),
                None => finished = true,
            })?;
        }

        assert_eq!(finished, parser.is_multipart_finished());
        Ok((resources, finished))
    }

    #[test]
    fn in_memory() {
        let (resources, finished) = run(&[BODY], None).unwrap();

        assert!(finished);
        assert_eq!(resources.len(), 2);

        assert_eq!(resources[0].key, "title");
        assert_eq!(resources[0].name, "");
        assert_eq!(resources[0].contents, b"hello\r\n--world");
        assert_eq!(resources[0].length, 14);

        assert_eq!(resources[1].key, "upload");
        assert_eq!(resources[1].name, "a.txt");
        assert_eq!(resources[1].kind, "text/plain");
        assert_eq!(resources[1].contents, b"file\r\ncontents");
        assert!(resources[1].is_in_memory);
    }

    #[test]
    fn split_everywhere() {
        let (expected, _) = run(&[BODY], None).unwrap();

        for split in 1..BODY.len() {
            let (head, tail) = BODY.split_at(split);
            let (resources, finished) = run(&[head, tail], None).unwrap();

            assert!(finished, "split at {split}");
            assert_eq!(resources, expected, "split at {split}");
        }
    }

    #[test]
    fn files_on_disk() {
        let dir = std::env::temp_dir();
        let (mut resources, _) = run(&[BODY], Some(dir)).unwrap();

        assert!(resources[0].is_in_memory);
        assert!(!resources[1].is_in_memory);
        assert_eq!(resources[1].length, 14);
        assert_eq!(std::fs::read(&resources[1].path).unwrap(), b"file\r\ncontents");

        let path = resources.remove(1).path;
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn malformed() {
        #[rustfmt::skip]
        let cases: [&[u8]; 4] = [
            b"--Nope\r\n",
            b"--XyZ\n",
            b"--XyZ\r\nBad Header: x\r\n\r\n",
            b"--XyZ\r\nA: b\r\n\r\ndata\r\n--XyZ!",
        ];

        for src in cases {
            assert_eq!(run(&[src], None).err(), Some(ErrorKind::InvalidMultipart), "{src:?}");
        }
    }

    #[test]
    fn resource_limit() {
        let mut parser = Parser::default();
        parser.prepare_for_multipart("XyZ", None, false, 1);

        let result = parser.multipart_parse(BODY, |_| {});
        assert_eq!(result, Err(ErrorKind::TooManyResources));
    }

    #[test]
    fn disposition() {
        let value = "form-data; name=\"file\"; filename=\"a b.txt\"";
        assert_eq!(header_param(value, "name").as_deref(), Some("file"));
        assert_eq!(header_param(value, "FILENAME").as_deref(), Some("a b.txt"));
        assert_eq!(header_param(value, "size"), None);
    }
}
