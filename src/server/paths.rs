//! Request locations mapped onto the files directory of a route.

use crate::errors::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Joins `location` onto `root`.
///
/// `.` segments are dropped and `..` segments pop the previous one;
/// popping above `root` is refused, as is any segment that would be read
/// as a root, a prefix or a separator by the host filesystem.
pub fn construct(root: &Path, location: &str) -> Result<PathBuf, ErrorKind> {
    let mut segments: Vec<&str> = Vec::new();

    for segment in location.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(ErrorKind::Forbidden)?;
            }
            segment if !is_plain(segment) => return Err(ErrorKind::Forbidden),
            segment => segments.push(segment),
        }
    }

    let mut path = root.to_path_buf();
    path.extend(segments);
    Ok(path)
}

#[inline]
fn is_plain(segment: &str) -> bool {
    !segment.contains(['\\', '\0'])
        && matches!(Path::new(segment).components().next(), Some(Component::Normal(_)))
        && Path::new(segment).components().count() == 1
}

/// Location of `path` below `root` with `/` separators, for listings.
pub fn relative(root: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rest
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("/{}", parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_paths() {
        let root = Path::new("/srv/www");

        #[rustfmt::skip]
        let cases = [
            ("/index.html",          Ok("/srv/www/index.html")),
            ("/a/./b//c.txt",        Ok("/srv/www/a/b/c.txt")),
            ("/a/../b.txt",          Ok("/srv/www/b.txt")),
            ("/",                    Ok("/srv/www")),
            ("/../etc/passwd",       Err(ErrorKind::Forbidden)),
            ("/a/../../etc",         Err(ErrorKind::Forbidden)),
            ("/a\\..\\b",            Err(ErrorKind::Forbidden)),
        ];

        for (location, expected) in cases {
            assert_eq!(construct(root, location), expected.map(PathBuf::from), "{location}");
        }
    }

    #[test]
    fn relative_locations() {
        let root = Path::new("/srv/www");
        assert_eq!(relative(root, Path::new("/srv/www/a/b.txt")).as_deref(), Some("/a/b.txt"));
        assert_eq!(relative(root, Path::new("/srv/www")).as_deref(), Some("/"));
        assert_eq!(relative(root, Path::new("/tmp")), None);
    }
}
