//! Default responses backed by the filesystem, plus the WebSocket
//! handshake.

use crate::{
    errors::ErrorKind,
    http::{
        types::Method,
        web_codec::{accept_key, Role},
    },
    router::entry::RouterEntry,
    server::{
        connection::Connection,
        paths,
        resources::{self, Compressor, Encode, ResourceInfo},
        utils,
        web_socket::WebSocketFrame,
    },
};
use std::fmt::Write;
use tokio::io::AsyncReadExt;

/// Serves a directory: redirects to the slashed location, then tries the
/// index files, then the listing when the route allows it.
pub(crate) async fn process_directory(
    conn: &mut Connection,
    entry: &RouterEntry,
    info: ResourceInfo,
) -> Result<(), ErrorKind> {
    if !conn.request.location.ends_with('/') {
        let mut location = utils::encode_path(&conn.request.location);
        location.push('/');
        if !conn.request.query.is_empty() {
            location.push('?');
            location.push_str(&conn.request.query);
        }

        conn.response.set_status(301).header("Location", &location);
        return Ok(());
    }

    if let Some(index) = resources::find_indexed(entry, &info.path).await {
        return process_resource(conn, entry, index).await;
    }

    match entry.allow_directory_listing {
        true => list_directory(conn, entry, &info).await,
        false => {
            conn.response.set_error(&ErrorKind::Forbidden);
            Ok(())
        }
    }
}

async fn list_directory(conn: &mut Connection, entry: &RouterEntry, info: &ResourceInfo) -> Result<(), ErrorKind> {
    let mut items = Vec::new();
    let mut reader = tokio::fs::read_dir(&info.path).await?;
    while let Some(item) = reader.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        let location = format!("{}{name}", conn.request.location);
        if resources::is_hidden(entry, &location) {
            continue;
        }

        let metadata = item.metadata().await?;
        items.push((metadata.is_dir(), name, metadata.len(), metadata.modified().ok()));
    }
    items.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let title = utils::escape_html(&conn.request.location);
    let mut page = String::with_capacity(512 + items.len() * 128);
    let _ = write!(
        page,
        "<!DOCTYPE html><html><head><title>Index of {title}</title></head>\
         <body><h1>Index of {title}</h1><table>"
    );
    if conn.request.location != "/" {
        page.push_str("<tr><td><a href=\"../\">../</a></td><td></td><td></td></tr>");
    }

    for (is_dir, name, size, modified) in items {
        let slash = if is_dir { "/" } else { "" };
        let href = utils::encode_path(&name);
        let size = match is_dir {
            true => "-".to_owned(),
            false => size.to_string(),
        };
        let modified = modified.map(utils::http_date).unwrap_or_default();
        let _ = write!(
            page,
            "<tr><td><a href=\"{href}{slash}\">{}{slash}</a></td><td>{size}</td><td>{modified}</td></tr>",
            utils::escape_html(&name)
        );
    }
    page.push_str("</table></body></html>");

    let router = conn.router().clone();
    conn.response
        .set_status(200)
        .header("Content-Type", &utils::content_type("text/html", &router.char_set))
        .body(page);
    Ok(())
}

/// Serves one file with validators, byte ranges and compression.
pub(crate) async fn process_resource(
    conn: &mut Connection,
    entry: &RouterEntry,
    info: ResourceInfo,
) -> Result<(), ErrorKind> {
    let router = conn.router().clone();
    let kind = utils::mime_type(&info.path, &entry.mime_types);
    let cache_control = match entry.static_file_max_age {
        0 => "no-cache".to_owned(),
        age => format!("max-age={age}"),
    };

    conn.resolve_ranges();
    conn.response
        .header("Accept-Ranges", "bytes")
        .header("ETag", &info.etag())
        .header("Last-Modified", &info.last_modified())
        .header("Cache-Control", &cache_control)
        .header("Content-Type", &utils::content_type(&kind, &router.char_set));

    if !resources::is_modified(&conn.request, &info) {
        conn.response.set_status(304);
        conn.write_head(None).await?;
        return conn.flush().await;
    }

    let ranged = conn.request.method == Method::Get
        && conn.request.headers.contains("Range")
        && resources::is_range_valid(&conn.request, &info);

    if ranged {
        match conn.request.get_ranges(info.size) {
            Ok(ranges) if ranges.len() == 1 => return process_range(conn, &info, ranges[0]).await,
            Ok(ranges) if ranges.len() > 1 => return process_ranges(conn, &info, &kind, &ranges).await,
            Ok(_) => {}
            Err(err) => {
                conn.response
                    .set_error(&err)
                    .header("Content-Range", &format!("bytes */{}", info.size));
                return Ok(());
            }
        }
    }

    conn.response.set_status(200);
    let encoding = resources::compressed(entry, &conn.request, Some(&info.path), &kind, info.size);
    if let Some(encoding) = encoding {
        conn.response
            .header("Content-Encoding", encoding.as_str())
            .header("Vary", "Accept-Encoding");
    }

    if conn.request.method == Method::Head {
        conn.write_head(encoding.map_or(Some(info.size), |_| None)).await?;
        return conn.flush().await;
    }

    if let Some(encoding) = encoding {
        return process_file_compress(conn, &info, Compressor::new(encoding, entry.compression.quality_level)).await;
    }

    if !entry.allow_send_file {
        let data = tokio::fs::read(&info.path).await?;
        conn.response.content.assign(data);
        return Ok(());
    }

    conn.write_head(Some(info.size)).await?;
    conn.write_file(&info.path, 0, info.size).await?;
    conn.flush().await
}

async fn process_range(conn: &mut Connection, info: &ResourceInfo, (start, end): (u64, u64)) -> Result<(), ErrorKind> {
    conn.response
        .set_status(206)
        .header("Content-Range", &format!("bytes {start}-{end}/{}", info.size));

    let length = end - start + 1;
    conn.write_head(Some(length)).await?;
    conn.write_file(&info.path, start, length).await?;
    conn.flush().await
}

async fn process_ranges(
    conn: &mut Connection,
    info: &ResourceInfo,
    kind: &str,
    ranges: &[(u64, u64)],
) -> Result<(), ErrorKind> {
    let boundary = utils::generate_boundary();
    conn.response
        .set_status(206)
        .header("Content-Type", &format!("multipart/byteranges; boundary={boundary}"));

    let length = utils::byteranges_length(&boundary, kind, ranges, info.size);
    conn.write_head(Some(length)).await?;

    for &(start, end) in ranges {
        let header = utils::byterange_header(&boundary, kind, start, end, info.size);
        conn.write_body(header.as_bytes()).await?;
        conn.write_file(&info.path, start, end - start + 1).await?;
    }

    conn.write_body(utils::byterange_footer(&boundary).as_bytes()).await?;
    conn.flush().await
}

/// Streams the file through `encoder` as a chunked body.
///
/// The head goes out once the first piece is coded. A coding failure
/// before that sends the file as is; after it, the body ends with the
/// output produced so far and the connection closes.
async fn process_file_compress<E: Encode>(
    conn: &mut Connection,
    info: &ResourceInfo,
    mut encoder: E,
) -> Result<(), ErrorKind> {
    let mut file = tokio::fs::File::open(&info.path).await?;
    let mut chunk = vec![0; conn.limits.resp.file_chunk_size.max(1)];
    let mut started = false;

    loop {
        let count = file.read(&mut chunk).await?;
        if count == 0 {
            break;
        }

        match encoder.update(&chunk[..count]) {
            Ok(output) => {
                if !started {
                    conn.write_head(None).await?;
                    started = true;
                }
                conn.write_chunk(&output).await?;
            }
            Err(err) => return uncompressed(conn, info, started, err).await,
        }
    }

    match encoder.finish() {
        Ok(output) => {
            if !started {
                conn.write_head(None).await?;
            }
            conn.write_chunk(&output).await?;
            conn.finish_chunks().await
        }
        Err(err) => uncompressed(conn, info, started, err).await,
    }
}

async fn uncompressed(
    conn: &mut Connection,
    info: &ResourceInfo,
    started: bool,
    err: std::io::Error,
) -> Result<(), ErrorKind> {
    tracing::debug!(%err, path = %info.path.display(), started, "compression failed");

    if started {
        conn.close();
        return conn.finish_chunks().await;
    }

    conn.response.headers.remove("Content-Encoding");
    conn.response.headers.remove("Vary");
    conn.write_head(Some(info.size)).await?;
    conn.write_file(&info.path, 0, info.size).await?;
    conn.flush().await
}

/// Validates an upgrade request and answers `101 Switching Protocols`.
///
/// On success the connection carries a fresh [`WebSocketFrame`] and
/// leaves the HTTP cycle; otherwise an error response is prepared.
pub(crate) async fn process_web_socket(conn: &mut Connection, entry: &RouterEntry) -> Result<(), ErrorKind> {
    let request = &conn.request;
    let key = request
        .get_header("Sec-WebSocket-Key")
        .map(|key| key.trim().to_owned())
        .unwrap_or_default();

    let valid = request.method == Method::Get
        && request.headers.has_token("Connection", "upgrade")
        && request.headers.has_token("Upgrade", "websocket")
        && is_valid_key(&key);

    if !valid {
        conn.response.set_error(&ErrorKind::HandshakeFailed);
        return Ok(());
    }

    if request.get_header("Sec-WebSocket-Version").as_deref().map(str::trim) != Some("13") {
        conn.response
            .set_error(&ErrorKind::HandshakeFailed)
            .set_status(426)
            .header("Sec-WebSocket-Version", "13");
        return Ok(());
    }

    if let Some(callback) = &entry.callbacks.web_socket_initiate {
        if !callback(conn) {
            if conn.response.is_undefined() {
                conn.response.set_error(&ErrorKind::Forbidden);
            }
            return Ok(());
        }
    }

    conn.response
        .set_status(101)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", &accept_key(&key));
    conn.write_head(None).await?;
    conn.flush().await?;

    tracing::debug!(location = %conn.request.location, peer = %conn.request.address, "websocket opened");
    conn.web_socket = Some(WebSocketFrame::new(Role::Server));
    Ok(())
}

/// A key is the base64 form of 16 bytes.
fn is_valid_key(key: &str) -> bool {
    use base64::{engine::general_purpose::STANDARD, Engine};
    key.len() == 24 && STANDARD.decode(key).is_ok_and(|bytes| bytes.len() == 16)
}

/// Filesystem path for the request on `entry`, `None` when the route
/// serves no files.
pub(crate) fn resolve(conn: &Connection, entry: &RouterEntry) -> Option<Result<std::path::PathBuf, ErrorKind>> {
    match entry.files_directory.as_os_str().is_empty() {
        true => None,
        false => Some(paths::construct(&entry.files_directory, &conn.request.location)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::HrmCache, limits::AllLimits, router::map::MapRouter, tools::parse_responses};
    use std::{io, sync::Arc};

    /// Upper-cases its input; fails once `updates` pieces were coded.
    struct Flaky {
        updates: usize,
    }

    impl Encode for Flaky {
        fn update(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
            match self.updates.checked_sub(1) {
                Some(left) => {
                    self.updates = left;
                    Ok(data.to_ascii_uppercase())
                }
                None => Err(io::Error::other("coding failed")),
            }
        }

        fn finish(self) -> io::Result<Vec<u8>> {
            Ok(b"!".to_vec())
        }
    }

    async fn serve_compressed(encoder: Flaky, data: &[u8]) -> Vec<u8> {
        let root = std::env::temp_dir().join(format!("maker_net_logical_{:016x}", fastrand::u64(..)));
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("page.txt");
        std::fs::write(&path, data).unwrap();
        let info = resources::resource_info(&path).await.unwrap();

        let mut limits = AllLimits::default();
        limits.resp.file_chunk_size = 4;
        let cache = Arc::new(HrmCache::new(&limits.resp));
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let mut conn = Connection::new(server, Arc::new(MapRouter::new()), cache, limits, "peer".to_owned());
        conn.response
            .set_status(200)
            .header("Content-Encoding", "gzip")
            .header("Vary", "Accept-Encoding");

        process_file_compress(&mut conn, &info, encoder).await.unwrap();
        drop(conn);

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        std::fs::remove_dir_all(root).unwrap();
        output
    }

    #[tokio::test]
    async fn compression_failures_degrade() {
        #[rustfmt::skip]
        let cases: [(usize, Option<&str>, Option<&str>, &[u8]); 3] = [
            (usize::MAX, Some("gzip"), None,      b"ABCDEFGHIJ!"),
            (1,          Some("gzip"), None,      b"ABCD"),
            (0,          None,         Some("10"), b"abcdefghij"),
        ];

        for (updates, encoding, length, body) in cases {
            let output = serve_compressed(Flaky { updates }, b"abcdefghij").await;
            let responses = parse_responses(&output);
            let response = &responses[0];

            assert_eq!(response.status_code, Some(200), "{updates}");
            assert_eq!(response.headers.get("Content-Encoding"), encoding, "{updates}");
            assert_eq!(response.headers.get("Content-Length"), length, "{updates}");
            assert_eq!(response.content.data, body, "{updates}");
        }
    }

    #[test]
    fn keys() {
        #[rustfmt::skip]
        let cases = [
            ("dGhlIHNhbXBsZSBub25jZQ==",  true),
            ("dGhlIHNhbXBsZSBub25jZQ",    false),
            ("not a key at all!!!!!!!!",  false),
            ("",                          false),
        ];

        for (key, expected) in cases {
            assert_eq!(is_valid_key(key), expected, "{key}");
        }
    }
}
