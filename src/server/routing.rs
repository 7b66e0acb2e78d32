//! Per-request dispatch: route resolution, policy checks, route callbacks
//! and the default method handlers.

use crate::{
    errors::ErrorKind,
    http::types::Method,
    router::entry::RouterEntry,
    server::{
        connection::Connection,
        logical, paths, permissions,
        resources::{self, ResourceInfo},
    },
};
use std::io;
use tokio::io::AsyncWriteExt;

/// Routes the parsed request and runs its handler.
///
/// Checks run in order: method allow-list, redirect, alias, credentials.
/// The route callback for the method goes first; when it is missing or
/// returns `false` the default handler answers. Handlers only prepare
/// `conn.response` unless they stream the body themselves.
pub(crate) async fn on_request_open(conn: &mut Connection) -> Result<(), ErrorKind> {
    let router = conn.router().clone();
    conn.route = router.construct_route(&mut conn.request);
    let entry = router.entry(conn.route);
    let method = conn.request.method;

    if !entry.proxy_ip_address.is_empty() {
        let forwarded = conn
            .request
            .get_header(&entry.proxy_ip_address)
            .and_then(|value| value.split(',').next().map(|address| address.trim().to_owned()))
            .filter(|address| !address.is_empty());
        if let Some(address) = forwarded {
            conn.request.address = address;
        }
    }

    if !entry.access_control_allow_origin.is_empty() {
        conn.response
            .header("Access-Control-Allow-Origin", &entry.access_control_allow_origin);
    }

    if !permissions::is_allowed(entry, method) {
        conn.response
            .set_error(&ErrorKind::MethodNotAllowed)
            .header("Allow", &permissions::allow_header(entry));
        return Ok(());
    }

    if !entry.redirect.is_empty() {
        let target = entry.redirect.replace("$uri", &conn.request.location);
        conn.response.set_status(302).header("Location", &target);
        return Ok(());
    }

    if !entry.alias.is_empty() {
        conn.request.location = entry.alias.replace("$uri", &conn.request.location);
    }

    if let Some(path) = logical::resolve(conn, entry) {
        match path {
            Ok(path) => conn.request.path = path,
            Err(err) => {
                conn.response.set_error(&err);
                return Ok(());
            }
        }
    }

    if !permissions::authorize(conn) {
        conn.response
            .set_error(&ErrorKind::Unauthorized)
            .header("WWW-Authenticate", &permissions::challenge(entry));
        return Ok(());
    }

    if let Some(callback) = entry.callbacks.for_method(method) {
        if callback(conn).await {
            return Ok(());
        }
    }

    match method {
        Method::Get | Method::Head => route_get(conn, entry).await,
        Method::Post | Method::Patch => route_post(conn, entry).await,
        Method::Put => route_put(conn, entry).await,
        Method::Delete => route_delete(conn, entry).await,
        Method::Options => {
            route_options(conn, entry);
            Ok(())
        }
    }
}

/// Looks the request path up, falling back to `try_files`. `None` means
/// the error response is already prepared.
async fn locate(conn: &mut Connection, entry: &RouterEntry) -> Option<ResourceInfo> {
    if entry.files_directory.as_os_str().is_empty() || resources::is_hidden(entry, &conn.request.location) {
        conn.response.set_error(&ErrorKind::NotFound);
        return None;
    }

    let found = match resources::resource_info(&conn.request.path).await {
        Err(ErrorKind::NotFound) => resources::try_files(entry, &conn.request.location).await,
        other => other.map(Some),
    };

    match found {
        Ok(Some(info)) => Some(info),
        Ok(None) => {
            conn.response.set_error(&ErrorKind::NotFound);
            None
        }
        Err(err) => {
            conn.response.set_error(&err);
            None
        }
    }
}

async fn route_get(conn: &mut Connection, entry: &RouterEntry) -> Result<(), ErrorKind> {
    if entry.allow_web_socket && conn.request.headers.contains("Upgrade") {
        return logical::process_web_socket(conn, entry).await;
    }

    let Some(info) = locate(conn, entry).await else {
        return Ok(());
    };

    match info.is_dir {
        true => logical::process_directory(conn, entry, info).await,
        false => logical::process_resource(conn, entry, info).await,
    }
}

/// Static files take no bodies: 405 when the file exists, 404 otherwise.
async fn route_post(conn: &mut Connection, entry: &RouterEntry) -> Result<(), ErrorKind> {
    if locate(conn, entry).await.is_some() {
        conn.response
            .set_error(&ErrorKind::MethodNotAllowed)
            .header("Allow", &permissions::allow_header(entry));
    }
    Ok(())
}

/// Writes the body to the resolved file: 201 when created, 204 when
/// replaced.
async fn route_put(conn: &mut Connection, entry: &RouterEntry) -> Result<(), ErrorKind> {
    if entry.files_directory.as_os_str().is_empty()
        || resources::is_hidden(entry, &conn.request.location)
        || conn.request.location.ends_with('/')
    {
        conn.response.set_error(&ErrorKind::Forbidden);
        return Ok(());
    }

    let path = conn.request.path.clone();
    let existed = match resources::resource_info(&path).await {
        Ok(info) if info.is_dir => {
            conn.response.set_error(&ErrorKind::Forbidden);
            return Ok(());
        }
        Ok(_) => true,
        Err(_) => false,
    };

    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "upload target refused");
            conn.response.set_error(&ErrorKind::Unprocessable);
            return Ok(());
        }
    };

    let mut chunk = Vec::new();
    while conn.fetch_next(&mut chunk).await? {
        file.write_all(&chunk).await?;
        chunk.clear();
    }
    file.flush().await?;

    match existed {
        true => {
            conn.response.set_status(204);
        }
        false => {
            let location = paths::relative(&entry.files_directory, &path).unwrap_or_default();
            conn.response.set_status(201).header("Location", &location);
        }
    }
    Ok(())
}

async fn route_delete(conn: &mut Connection, entry: &RouterEntry) -> Result<(), ErrorKind> {
    let Some(info) = locate(conn, entry).await else {
        return Ok(());
    };

    if info.is_dir {
        conn.response.set_error(&ErrorKind::Forbidden);
        return Ok(());
    }

    match tokio::fs::remove_file(&info.path).await {
        Ok(()) => {
            conn.response.set_status(204);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            conn.response.set_error(&ErrorKind::NotFound);
        }
        Err(err) => {
            tracing::warn!(path = %info.path.display(), %err, "delete failed");
            conn.response.set_error(&ErrorKind::Forbidden);
        }
    }
    Ok(())
}

/// `204` with `Allow`, plus the CORS preflight answer when the route sets
/// an allowed origin.
fn route_options(conn: &mut Connection, entry: &RouterEntry) {
    let allow = permissions::allow_header(entry);
    conn.response.set_status(204).header("Allow", &allow);

    if !entry.access_control_allow_origin.is_empty() {
        let headers = conn
            .request
            .get_header("Access-Control-Request-Headers")
            .map(|value| value.into_owned())
            .unwrap_or_else(|| "*".to_owned());

        conn.response
            .header("Access-Control-Allow-Methods", &allow)
            .header("Access-Control-Allow-Headers", &headers)
            .header("Access-Control-Max-Age", "86400");
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        http::request::AuthType,
        limits::AllLimits,
        tools::{exchange, parse_responses},
        MapRouter, Method, StatusCode,
    };

    fn temp_root(files: &[(&str, &str)]) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!("maker_net_routing_{}", fastrand::u64(..)));
        std::fs::create_dir_all(root.join("docs")).unwrap();
        for (name, contents) in files {
            std::fs::write(root.join(name), contents).unwrap();
        }
        root
    }

    #[tokio::test]
    async fn policy_checks() {
        let mut router = MapRouter::new();
        {
            let entry = router
                .get("^/admin", |conn| Box::pin(async move {
                    let name = conn.request.user.username.clone();
                    conn.response.status(StatusCode::Ok).body(name);
                    true
                }))
                .unwrap();
            entry.auth.kind = AuthType::Basic;
            entry.auth.realm = "staff".into();
            entry.disallowed_methods = vec![Method::Delete];
            entry.on_authorize(|_, user| user.username == "user" && user.password == "pass");
        }
        router.get("^/old$", |_| Box::pin(async { false })).unwrap().redirect = "/new".into();
        router.sort();

        let input = b"GET /admin HTTP/1.1\r\n\r\n\
            GET /admin HTTP/1.1\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n\
            GET /admin HTTP/1.1\r\nAuthorization: Basic dXNlcjp3cm9uZw==\r\n\r\n\
            DELETE /admin HTTP/1.1\r\n\r\n\
            GET /old HTTP/1.1\r\n\r\n\
            OPTIONS /admin HTTP/1.1\r\nConnection: close\r\n\r\n";

        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        #[rustfmt::skip]
        let expected = [401, 200, 401, 405, 302, 204];
        let statuses: Vec<_> = responses.iter().map(|response| response.status_code.unwrap_or(0)).collect();
        assert_eq!(statuses, expected);

        assert_eq!(responses[0].headers.get("WWW-Authenticate"), Some("Basic realm=\"staff\""));
        assert_eq!(responses[1].content.data, b"user");
        assert!(!responses[3].headers.get_joined("Allow").unwrap_or_default().contains("DELETE"));
        assert_eq!(responses[4].headers.get("Location"), Some("/new"));
        assert!(responses[5].headers.get_joined("Allow").unwrap_or_default().contains("GET"));
    }

    #[tokio::test]
    async fn filesystem_methods() {
        let root = temp_root(&[("a.txt", "alpha"), ("docs/index.html", "<p>docs</p>")]);
        let mut router = MapRouter::new();
        router.base.files_directory = root.clone();
        router.base.hidden_files = vec![regex::Regex::new(r"^\.").unwrap()];
        std::fs::write(root.join(".secret"), "x").unwrap();

        let input = b"GET /a.txt HTTP/1.1\r\n\r\n\
            GET /docs HTTP/1.1\r\n\r\n\
            GET /docs/ HTTP/1.1\r\n\r\n\
            GET /.secret HTTP/1.1\r\n\r\n\
            GET /../etc/passwd HTTP/1.1\r\n\r\n\
            PUT /b.txt HTTP/1.1\r\nContent-Length: 4\r\n\r\nbeta\
            PUT /b.txt HTTP/1.1\r\nContent-Length: 5\r\n\r\ngamma\
            POST /a.txt HTTP/1.1\r\nContent-Length: 1\r\n\r\nx\
            DELETE /a.txt HTTP/1.1\r\n\r\n\
            GET /a.txt HTTP/1.1\r\nConnection: close\r\n\r\n";

        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        #[rustfmt::skip]
        let expected = [200, 301, 200, 404, 403, 201, 204, 405, 204, 404];
        let statuses: Vec<_> = responses.iter().map(|response| response.status_code.unwrap_or(0)).collect();
        assert_eq!(statuses, expected);

        assert_eq!(responses[0].content.data, b"alpha");
        assert_eq!(responses[1].headers.get("Location"), Some("/docs/"));
        assert_eq!(responses[2].content.data, b"<p>docs</p>");
        assert_eq!(std::fs::read(root.join("b.txt")).unwrap(), b"gamma");
        assert!(!root.join("a.txt").exists());

        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn directory_listing() {
        let root = temp_root(&[("docs/one.txt", "1"), ("docs/two <b>.txt", "22")]);
        let mut router = MapRouter::new();
        router.base.files_directory = root.clone();
        router.base.allow_directory_listing = true;
        router.base.index_files.clear();

        let input = b"GET /docs/ HTTP/1.1\r\nConnection: close\r\n\r\n";
        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);
        let page = responses[0].content.get_text();

        assert_eq!(responses[0].status_code, Some(200));
        assert!(page.contains("Index of /docs/"));
        assert!(page.contains("<a href=\"one.txt\">one.txt</a>"));
        assert!(page.contains("<a href=\"two%20%3Cb%3E.txt\">two &lt;b&gt;.txt</a>"));

        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn cors_preflight() {
        let mut router = MapRouter::new();
        router.base.access_control_allow_origin = "*".into();

        let input = b"OPTIONS /api HTTP/1.1\r\nAccess-Control-Request-Headers: X-Token\r\n\
            Connection: close\r\n\r\n";
        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(204));
        assert_eq!(responses[0].headers.get("Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(responses[0].headers.get("Access-Control-Allow-Headers"), Some("X-Token"));
        assert_eq!(responses[0].headers.get("Access-Control-Max-Age"), Some("86400"));
    }
}
