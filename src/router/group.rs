//! Route groups: a location filter shared by an ordered list of routes.

use crate::router::entry::RouterEntry;

/// How a group's match string is compared with the request location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    /// Location equals the match string.
    Exact,
    /// Location starts with the match string, which is trimmed off.
    #[default]
    Start,
    /// Location contains the match string anywhere.
    Match,
    /// Location ends with the match string, which is trimmed off.
    End,
}

/// Routes sharing one location filter, tried in order after
/// [`MapRouter::sort`](crate::MapRouter::sort).
#[derive(Debug, Clone, Default)]
pub struct RouterGroup {
    pub location: String,
    pub mode: RouteMode,
    /// Restricts the group to one `Host` (port excluded).
    pub hostname: Option<String>,
    pub routes: Vec<RouterEntry>,
}

impl RouterGroup {
    pub fn new(location: &str, mode: RouteMode) -> Self {
        Self {
            location: location.to_owned(),
            mode,
            hostname: None,
            routes: Vec::new(),
        }
    }

    /// The part of `path` left for the group's route patterns, or `None`
    /// when the group does not apply.
    pub(crate) fn matches<'a>(&self, path: &'a str, host: Option<&str>) -> Option<&'a str> {
        if let Some(hostname) = &self.hostname {
            if !host.is_some_and(|host| host.eq_ignore_ascii_case(hostname)) {
                return None;
            }
        }

        match self.mode {
            RouteMode::Exact => (path == self.location).then_some(path),
            RouteMode::Start => path.strip_prefix(self.location.as_str()),
            RouteMode::Match => path.contains(self.location.as_str()).then_some(path),
            RouteMode::End => path.strip_suffix(self.location.as_str()),
        }
    }

    /// Orders routes by level, then literal before regex, then by
    /// pattern length, longest first. Equal routes keep their
    /// registration order.
    pub(crate) fn sort(&mut self) {
        self.routes.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then_with(|| b.is_literal().cmp(&a.is_literal()))
                .then_with(|| b.pattern.len().cmp(&a.pattern.len()))
        });
    }
}
