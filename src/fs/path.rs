//! Path normalisation and mount-point classification.

use serde::{Deserialize, Serialize};

/// Lexically normalise a slash-separated path: collapse repeated slashes,
/// drop `.` elements, resolve `..` against the preceding element, and never
/// climb above the root of a rooted path. The empty path cleans to `.`.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let bytes = path.as_bytes();
    let n = bytes.len();
    let rooted = bytes[0] == b'/';
    let mut out: Vec<u8> = Vec::with_capacity(n);
    let mut r = 0;
    // Index in `out` below which `..` cannot backtrack.
    let mut dotdot = 0;
    if rooted {
        out.push(b'/');
        r = 1;
        dotdot = 1;
    }

    while r < n {
        if bytes[r] == b'/' {
            r += 1;
        } else if bytes[r] == b'.' && (r + 1 == n || bytes[r + 1] == b'/') {
            r += 1;
        } else if bytes[r] == b'.'
            && r + 1 < n
            && bytes[r + 1] == b'.'
            && (r + 2 == n || bytes[r + 2] == b'/')
        {
            r += 2;
            if out.len() > dotdot {
                let mut w = out.len() - 1;
                while w > dotdot && out[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                if !out.is_empty() {
                    out.push(b'/');
                }
                out.extend_from_slice(b"..");
                dotdot = out.len();
            }
        } else {
            if (rooted && out.len() != 1) || (!rooted && !out.is_empty()) {
                out.push(b'/');
            }
            while r < n && bytes[r] != b'/' {
                out.push(bytes[r]);
                r += 1;
            }
        }
    }

    if out.is_empty() {
        return ".".to_string();
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split a cleaned absolute path into its parent directory and final name.
/// The root splits into `("/", "")`.
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None if trimmed.is_empty() => ("/", ""),
        None => (".", trimmed),
    }
}

/// Resolve `rel` against an in-mount directory path. Absolute `rel` wins.
pub fn join_path(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        clean_path(rel)
    } else {
        clean_path(&format!("{}/{}", base, rel))
    }
}

/// The process working directory as far as the client knows it.
///
/// When `in_mount` is set, `path` is the in-mount path of the directory;
/// otherwise it is whatever native path was last reported, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cwd {
    pub path: String,
    pub in_mount: bool,
}

impl Cwd {
    pub fn native(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            in_mount: false,
        }
    }

    pub fn mount(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            in_mount: true,
        }
    }
}

/// Decides whether a process path belongs to the distributed mount and
/// translates it to the path the storage SDK understands.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    mount_point: String,
    ignore: Vec<String>,
}

impl PathClassifier {
    /// `mount_point` must be an absolute cleaned path; `ignore` holds in-mount
    /// prefixes without a leading slash.
    pub fn new(mount_point: &str, ignore: Vec<String>) -> Self {
        Self {
            mount_point: clean_path(mount_point),
            ignore,
        }
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    /// Map `path` as seen by the process to an in-mount path, or `None` if the
    /// call belongs to the native filesystem.
    pub fn classify(&self, path: &str, cwd: &Cwd) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        let in_mount = if path.starts_with('/') {
            self.strip_mount(&clean_path(path))?
        } else if cwd.in_mount {
            join_path(&cwd.path, path)
        } else {
            return None;
        };
        if self.is_ignored(&in_mount) {
            return None;
        }
        Some(in_mount)
    }

    /// In-mount path back to the path the process would use.
    pub fn process_path(&self, in_mount: &str) -> String {
        if in_mount == "/" || in_mount.is_empty() {
            self.mount_point.clone()
        } else {
            format!("{}{}", self.mount_point, in_mount)
        }
    }

    fn strip_mount(&self, cleaned: &str) -> Option<String> {
        let rest = cleaned.strip_prefix(self.mount_point.as_str())?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }

    fn is_ignored(&self, in_mount: &str) -> bool {
        let rel = in_mount.trim_start_matches('/');
        self.ignore.iter().any(|prefix| {
            rel == prefix || (rel.starts_with(prefix.as_str()) && rel[prefix.len()..].starts_with('/'))
        })
    }
}
