//! End-to-end exchanges over an in-memory socket.

use crate::{
    http::{
        parser::{Parser, Progress},
        web_codec::accept_key,
    },
    limits::{AllLimits, ReqLimits},
    tools::{exchange, parse_responses},
    Cookie, MapRouter, ResponseFrame, StatusCode,
};
use flate2::read::GzDecoder;
use regex::Regex;
use std::{io::Read, path::PathBuf};

struct Site {
    root: PathBuf,
}

impl Site {
    fn new(files: &[(&str, &[u8])]) -> Self {
        let root = std::env::temp_dir().join(format!("maker_net_site_{:016x}", fastrand::u64(..)));
        std::fs::create_dir_all(&root).unwrap();
        for (name, contents) in files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }
        Self { root }
    }

    fn router(&self) -> MapRouter {
        let mut router = MapRouter::new();
        router.base.files_directory = self.root.clone();
        router
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[tokio::test]
async fn static_file_and_revalidation() {
    let page: &[u8] = b"<!DOCTYPE html><html><body>index</body></html>";
    let site = Site::new(&[("index.html", page)]);

    let input = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
    let output = exchange(site.router(), AllLimits::default(), input).await;
    let responses = parse_responses(&output);
    let first = &responses[0];

    assert_eq!(first.status_code, Some(200));
    assert_eq!(first.headers.get("Content-Length"), Some(page.len().to_string().as_str()));
    assert_eq!(first.headers.get("Accept-Ranges"), Some("bytes"));
    assert!(first.headers.get("Last-Modified").is_some());
    assert_eq!(first.content.data, page);

    let etag = first.headers.get("ETag").unwrap().to_owned();
    let input = format!("GET /index.html HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\r\n");
    let output = exchange(site.router(), AllLimits::default(), input.as_bytes()).await;
    let responses = parse_responses(&output);

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status_code, Some(304));
    assert_eq!(responses[0].headers.get("ETag"), Some(etag.as_str()));
    assert!(responses[0].headers.get("Content-Length").is_none());
    assert!(responses[0].content.data.is_empty());
}

#[tokio::test]
async fn byte_range_of_a_file() {
    let data: Vec<u8> = (0..100).collect();
    let site = Site::new(&[("data.bin", data.as_slice())]);

    let input = b"GET /data.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=0-9\r\n\r\n";
    let output = exchange(site.router(), AllLimits::default(), input).await;
    let responses = parse_responses(&output);
    let response = &responses[0];

    assert_eq!(response.status_code, Some(206));
    assert_eq!(response.headers.get("Content-Range"), Some("bytes 0-9/100"));
    assert_eq!(response.content.data, &data[..10]);
}

#[tokio::test]
async fn if_range_with_stale_validator() {
    let data: Vec<u8> = (0..100).collect();
    let site = Site::new(&[("data.bin", data.as_slice())]);

    let first = b"GET /data.bin HTTP/1.1\r\nHost: x\r\n\r\n";
    let output = exchange(site.router(), AllLimits::default(), first).await;
    let etag = parse_responses(&output)[0].headers.get("ETag").unwrap().to_owned();

    #[rustfmt::skip]
    let cases = [
        (true,  "\"stale\"",     200, 100),
        (false, "\"stale\"",     200, 100),
        (true,  etag.as_str(),   206, 10),
        (false, etag.as_str(),   206, 10),
    ];

    for (send_file, validator, status, length) in cases {
        let mut router = site.router();
        router.base.allow_send_file = send_file;

        let input = format!("GET /data.bin HTTP/1.1\r\nHost: x\r\nRange: bytes=0-9\r\nIf-Range: {validator}\r\n\r\n");
        let output = exchange(router, AllLimits::default(), input.as_bytes()).await;
        let responses = parse_responses(&output);
        let response = &responses[0];

        assert_eq!(response.status_code, Some(status), "{send_file} {validator}");
        assert_eq!(response.content.data, &data[..length], "{send_file} {validator}");
        assert_eq!(response.headers.get("Content-Range").is_some(), status == 206);
    }
}

#[tokio::test]
async fn hidden_directory_contents() {
    let site = Site::new(&[(".git/config", b"secret".as_slice()), ("docs/readme.txt", b"public".as_slice())]);

    #[rustfmt::skip]
    let cases = [
        ("/.git/config",        404),
        ("/.git/",              404),
        ("/docs/readme.txt",    200),
    ];

    for (location, status) in cases {
        let mut router = site.router();
        router.base.hidden_files = vec![Regex::new(r"^\.").unwrap()];
        router.base.allow_directory_listing = true;

        let input = format!("GET {location} HTTP/1.1\r\nHost: x\r\n\r\n");
        let output = exchange(router, AllLimits::default(), input.as_bytes()).await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(status), "{location}");
        assert!(!responses[0].content.get_text().contains("secret"), "{location}");
    }
}

#[tokio::test]
async fn compressed_file_head_matches_get() {
    let text = "compressible line of text\n".repeat(100);
    let site = Site::new(&[("notes.txt", text.as_bytes())]);

    let mut heads = Vec::new();
    for method in ["GET", "HEAD"] {
        let mut router = site.router();
        router.base.compression.enabled = true;

        let input = format!("{method} /notes.txt HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n");
        let output = exchange(router, AllLimits::default(), input.as_bytes()).await;

        let mut parsed = ResponseFrame::new();
        let mut parser = Parser::new(&ReqLimits::default());
        let end = match parser.parse_response(&output, 0, &mut parsed).unwrap() {
            Progress::Complete(end) => end,
            Progress::Partial => panic!("incomplete head"),
        };

        if method == "GET" {
            let responses = parse_responses(&output);
            let mut decoded = String::new();
            GzDecoder::new(responses[0].content.data.as_slice()).read_to_string(&mut decoded).unwrap();
            assert_eq!(decoded, text);
        } else {
            assert_eq!(end, output.len());
        }
        heads.push(parsed);
    }

    for name in ["Content-Encoding", "Vary", "Transfer-Encoding", "Content-Length", "ETag"] {
        assert_eq!(heads[0].headers.get(name), heads[1].headers.get(name), "{name}");
    }
    assert_eq!(heads[1].headers.get("Content-Encoding"), Some("gzip"));
    assert_eq!(heads[1].headers.get("Content-Length"), None);
}

#[tokio::test]
async fn multipart_form_upload() {
    let site = Site::new(&[]);
    let mut router = MapRouter::new();
    router.temporary_directory = Some(site.root.clone());
    router
        .post("^/form$", |conn| Box::pin(async move {
            if let Err(err) = conn.store(false).await {
                conn.response.set_error(&err);
                return true;
            }

            let lines: Vec<String> = conn
                .request
                .content
                .resources
                .iter()
                .map(|resource| {
                    let stored = match resource.is_in_memory {
                        true => resource.contents.clone(),
                        false => std::fs::read(&resource.path).unwrap_or_default(),
                    };
                    format!(
                        "{}|{}|{}|{}|{}|{}",
                        resource.key,
                        resource.name,
                        resource.kind,
                        resource.length,
                        resource.is_in_memory,
                        String::from_utf8_lossy(&stored)
                    )
                })
                .collect();
            conn.response.status(StatusCode::Ok).body(lines.join("\n"));
            true
        }))
        .unwrap();

    let body = "--XyZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        Report\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line one\r\nline two\r\n\
        --XyZ--\r\n";
    let input = format!(
        "POST /form HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=XyZ\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );

    let output = exchange(router, AllLimits::default(), input.as_bytes()).await;
    let responses = parse_responses(&output);
    let response = &responses[0];

    assert_eq!(response.status_code, Some(200));
    assert_eq!(
        response.content.get_text(),
        "title|||6|true|Report\ndoc|a.txt|text/plain|18|false|line one\r\nline two"
    );
}

#[tokio::test]
async fn web_socket_handshake() {
    let mut router = MapRouter::new();
    router.base.allow_web_socket = true;

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let input = format!(
        "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    let output = exchange(router, AllLimits::default(), input.as_bytes()).await;
    let responses = parse_responses(&output);
    let response = &responses[0];

    assert_eq!(response.status_code, Some(101));
    assert_eq!(response.headers.get("Upgrade"), Some("websocket"));
    assert_eq!(response.headers.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert_eq!(accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[tokio::test]
async fn composed_response_parses_back() {
    let mut router = MapRouter::new();
    router
        .get("^/compose$", |conn| Box::pin(async move {
            conn.response
                .status(StatusCode::Created)
                .header("Content-Type", "application/json")
                .header("X-Trace", "abc")
                .set_cookie(Cookie::new("sid", "42"))
                .body(r#"{"id":7}"#);
            true
        }))
        .unwrap();

    let input = b"GET /compose HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let output = exchange(router, AllLimits::default(), input).await;

    let mut parsed = ResponseFrame::new();
    let mut parser = Parser::new(&ReqLimits::default());
    let end = match parser.parse_response(&output, 0, &mut parsed).unwrap() {
        Progress::Complete(end) => end,
        Progress::Partial => panic!("incomplete head"),
    };

    assert_eq!(parsed.status_code, Some(201));
    assert_eq!(parsed.headers.get("Content-Type"), Some("application/json"));
    assert_eq!(parsed.headers.get("X-Trace"), Some("abc"));
    assert_eq!(parsed.headers.get("Connection"), Some("close"));
    assert_eq!(parsed.get_cookie("sid").map(|cookie| cookie.value.as_str()), Some("42"));
    assert_eq!(&output[end..], br#"{"id":7}"#);
}
