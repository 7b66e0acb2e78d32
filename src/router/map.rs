//! The routing table.

use crate::{
    errors::ErrorKind,
    http::{request::RequestFrame, web_codec::Opcode},
    router::{
        entry::{HandlerFuture, RouterEntry},
        group::{RouteMode, RouterGroup},
    },
    server::{connection::Connection, web_socket::WebSocketFrame},
};
use std::{path::PathBuf, sync::Arc, time::Duration};

/// Resolved route of a request; stable for the lifetime of the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteId {
    #[default]
    Base,
    Entry { group: usize, index: usize },
}

/// Session cookie parameters used by [`Connection::set_session`].
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub domain: String,
    pub path: String,
    pub same_site: String,
    /// Lifetime from the moment the cookie is set; zero makes it a
    /// browser-session cookie.
    pub expires: Duration,
    pub secure: bool,
    pub http_only: bool,
}

impl Default for SessionCookie {
    fn default() -> Self {
        Self {
            name: "sid".into(),
            domain: String::new(),
            path: "/".into(),
            same_site: "Strict".into(),
            expires: Duration::ZERO,
            secure: false,
            http_only: true,
        }
    }
}

/// Routes grouped by location filter, plus the router-wide settings.
///
/// Register routes, call [`sort`](Self::sort), then hand the router to
/// the server. Resolution tries groups with longer match strings first
/// and, within a group, the first matching pattern wins; anything left
/// over goes to [`base`](Self::base).
///
/// # Examples
/// ```
/// use maker_net::{MapRouter, Method, RequestFrame, RouteId};
///
/// let mut router = MapRouter::new();
/// router.get("^/users/(\\d+)$", |conn| Box::pin(async move {
///     let id = conn.request.matches[1].clone();
///     conn.response.body(id);
///     true
/// })).unwrap();
/// router.sort();
///
/// let mut request = RequestFrame::new(Method::Get, "/users/42");
/// assert_ne!(router.construct_route(&mut request), RouteId::Base);
/// assert_eq!(request.matches, ["/users/42", "42"]);
/// ```
#[derive(Debug, Clone)]
pub struct MapRouter {
    pub base: RouterEntry,
    pub groups: Vec<RouterGroup>,
    /// Host names and ports served. With more than one, requests for
    /// other hosts get the base route.
    pub listeners: Vec<(String, u16)>,
    /// Uploads are written here; `None` keeps them in memory.
    pub temporary_directory: Option<PathBuf>,
    pub max_uploadable_resources: usize,
    /// Requests served per connection; 0 disables keep-alive.
    pub keep_alive_max_count: usize,
    pub session: SessionCookie,
    pub char_set: String,
}

impl Default for MapRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MapRouter {
    pub fn new() -> Self {
        Self {
            base: RouterEntry::default(),
            groups: Vec::new(),
            listeners: Vec::new(),
            temporary_directory: None,
            max_uploadable_resources: 10,
            keep_alive_max_count: 50,
            session: SessionCookie::default(),
            char_set: "utf-8".into(),
        }
    }

    pub fn listen(&mut self, hostname: &str, port: u16) -> &mut Self {
        self.listeners.push((hostname.to_owned(), port));
        self
    }

    /// Index of the group for `location` and `mode`, created if missing.
    pub fn group(&mut self, location: &str, mode: RouteMode) -> usize {
        match self
            .groups
            .iter()
            .position(|group| group.location == location && group.mode == mode && group.hostname.is_none())
        {
            Some(index) => index,
            None => {
                self.groups.push(RouterGroup::new(location, mode));
                self.groups.len() - 1
            }
        }
    }

    /// The route for `pattern` inside the group `(group_match, mode)`,
    /// created if missing. New routes copy the base configuration when
    /// `inherit_props` is set.
    pub fn route(
        &mut self,
        group_match: &str,
        mode: RouteMode,
        pattern: &str,
        inherit_props: bool,
    ) -> Result<&mut RouterEntry, ErrorKind> {
        let group = self.group(group_match, mode);

        let existing = self.groups[group].routes.iter().position(|route| route.pattern == pattern);
        let index = match existing {
            Some(index) => index,
            None => {
                let entry = match inherit_props {
                    true => RouterEntry::from(&self.base, pattern)?,
                    false => RouterEntry::new(pattern)?,
                };
                let routes = &mut self.groups[group].routes;
                routes.push(entry);
                routes.len() - 1
            }
        };

        Ok(&mut self.groups[group].routes[index])
    }

    pub fn get<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_get(callback))
    }

    pub fn post<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_post(callback))
    }

    pub fn put<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_put(callback))
    }

    pub fn patch<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_patch(callback))
    }

    pub fn delete<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_delete(callback))
    }

    pub fn options<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_options(callback))
    }

    pub fn web_socket_initiate<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: Fn(&mut Connection) -> bool + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_web_socket_initiate(callback))
    }

    pub fn web_socket_connect<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: Fn(&Arc<WebSocketFrame>) + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_web_socket_connect(callback))
    }

    pub fn web_socket_receive<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: Fn(&Arc<WebSocketFrame>, Opcode, &[u8]) + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_web_socket_receive(callback))
    }

    pub fn web_socket_disconnect<F>(&mut self, pattern: &str, callback: F) -> Result<&mut RouterEntry, ErrorKind>
    where
        F: Fn(&Arc<WebSocketFrame>) + Send + Sync + 'static,
    {
        Ok(self.route("", RouteMode::Start, pattern, true)?.on_web_socket_disconnect(callback))
    }

    /// Orders groups by match string length, longest first, and each
    /// group's routes by priority. Stable, so repeated calls are no-ops.
    pub fn sort(&mut self) {
        self.groups.sort_by(|a, b| b.location.len().cmp(&a.location.len()));
        for group in &mut self.groups {
            group.sort();
        }
    }

    /// Resolves the route for `request`, storing pattern captures in
    /// `request.matches`.
    pub fn construct_route(&self, request: &mut RequestFrame) -> RouteId {
        request.matches.clear();

        let host = request.headers.get("Host").map(strip_port);
        if self.listeners.len() > 1
            && !host.is_some_and(|host| self.listeners.iter().any(|(name, _)| name.eq_ignore_ascii_case(host)))
        {
            return RouteId::Base;
        }

        for (group_index, group) in self.groups.iter().enumerate() {
            let Some(location) = group.matches(&request.location, host) else {
                continue;
            };

            for (index, route) in group.routes.iter().enumerate() {
                let Some(captures) = route.location.as_ref().and_then(|regex| regex.captures(location)) else {
                    continue;
                };

                request.matches = captures
                    .iter()
                    .map(|capture| capture.map_or_else(String::new, |capture| capture.as_str().to_owned()))
                    .collect();
                return RouteId::Entry {
                    group: group_index,
                    index,
                };
            }
        }

        RouteId::Base
    }

    /// The entry behind `id`; unknown ids resolve to the base route.
    pub fn entry(&self, id: RouteId) -> &RouterEntry {
        match id {
            RouteId::Base => &self.base,
            RouteId::Entry { group, index } => self
                .groups
                .get(group)
                .and_then(|group| group.routes.get(index))
                .unwrap_or(&self.base),
        }
    }
}

/// `example.com:8080` -> `example.com`, `[::1]:80` -> `[::1]`.
pub(crate) fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(index) if !host[index..].contains(']') => &host[..index],
        _ => host,
    }
}
