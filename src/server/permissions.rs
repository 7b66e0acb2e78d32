//! `Authorization` handling for protected routes.

use crate::{
    http::{
        request::{AuthType, Credentials, RequestFrame},
        types::Method,
    },
    router::entry::RouterEntry,
    server::connection::Connection,
};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Credentials carried by the `Authorization` header. Unknown schemes
/// and malformed Basic tokens give [`AuthType::None`].
pub fn credentials(request: &RequestFrame) -> Credentials {
    let Some(value) = request.get_header("Authorization") else {
        return Credentials::default();
    };

    let value = value.trim();
    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    let token = token.trim();

    if scheme.eq_ignore_ascii_case("Basic") {
        let decoded = STANDARD
            .decode(token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let Some((username, password)) = decoded.as_deref().and_then(|text| text.split_once(':')) else {
            return Credentials::default();
        };

        return Credentials {
            kind: AuthType::Basic,
            token: format!("{username}:{password}"),
            username: username.to_owned(),
            password: password.to_owned(),
            authorized: false,
        };
    }

    if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() {
        return Credentials {
            kind: AuthType::Bearer,
            token: token.to_owned(),
            ..Credentials::default()
        };
    }

    Credentials::default()
}

/// Checks the request against the route's auth settings.
///
/// Routes without auth, and methods it does not cover, pass. Otherwise
/// the credentials must use the configured scheme and be accepted by the
/// route's `authorize` callback; without a callback nobody gets in. The
/// outcome lands in `request.user`.
pub fn authorize(conn: &mut Connection) -> bool {
    let router = conn.router().clone();
    let entry = router.entry(conn.route);

    if !entry.requires_auth(conn.request.method) {
        return true;
    }

    let mut user = credentials(&conn.request);
    if user.kind == entry.auth.kind {
        user.authorized = match &entry.callbacks.authorize {
            Some(callback) => callback(conn, &user),
            None => false,
        };
    }

    let authorized = user.authorized;
    if !authorized {
        tracing::debug!(location = %conn.request.location, kind = ?user.kind, "authorization refused");
    }
    conn.request.user = user;
    authorized
}

/// `WWW-Authenticate` value for a refused request.
pub fn challenge(entry: &RouterEntry) -> String {
    let scheme = match entry.auth.kind {
        AuthType::Bearer => "Bearer",
        _ => "Basic",
    };
    format!("{scheme} realm=\"{}\"", entry.auth.realm.replace('"', "'"))
}

/// Whether `method` may reach the route at all.
#[inline]
pub fn is_allowed(entry: &RouterEntry, method: Method) -> bool {
    !entry.disallowed_methods.contains(&method)
}

/// `Allow` header value for the route.
pub fn allow_header(entry: &RouterEntry) -> String {
    entry
        .allowed_methods()
        .map(|method| method.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_credentials() {
        #[rustfmt::skip]
        let cases = [
            (None,                                   AuthType::None,   "",            ""),
            (Some("Basic dXNlcjpwYXNz"),             AuthType::Basic,  "user:pass",   "user"),
            (Some("basic   dXNlcjpwYXNz  "),         AuthType::Basic,  "user:pass",   "user"),
            (Some("Basic bm9jb2xvbg=="),             AuthType::None,   "",            ""),
            (Some("Basic !!!"),                      AuthType::None,   "",            ""),
            (Some("Bearer abc.def"),                 AuthType::Bearer, "abc.def",     ""),
            (Some("Bearer"),                         AuthType::None,   "",            ""),
            (Some("Digest x"),                       AuthType::None,   "",            ""),
        ];

        for (header, kind, token, username) in cases {
            let mut request = RequestFrame::new(Method::Get, "/");
            if let Some(header) = header {
                request.headers.insert("Authorization", header);
            }

            let user = credentials(&request);
            assert_eq!(user.kind, kind, "{header:?}");
            assert_eq!(user.token, token, "{header:?}");
            assert_eq!(user.username, username, "{header:?}");
            assert!(!user.authorized);
        }
    }

    #[test]
    fn route_helpers() {
        let mut entry = RouterEntry::new("^/admin").unwrap();
        entry.auth.kind = AuthType::Bearer;
        entry.auth.realm = "staff \"only\"".into();
        entry.disallowed_methods = vec![Method::Delete];

        assert_eq!(challenge(&entry), "Bearer realm=\"staff 'only'\"");
        assert!(is_allowed(&entry, Method::Get));
        assert!(!is_allowed(&entry, Method::Delete));
        assert!(!allow_header(&entry).contains("DELETE"));
        assert!(allow_header(&entry).contains("GET"));
    }
}
