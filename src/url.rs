//! Prefix matching and reversible URL rewriting for mounted layers.
//!
//! A layer mounted at `/api` sees `/api/users` as `/users`. The dispatcher
//! strips the mount prefix before calling the layer and puts it back before
//! moving on, so each layer sees the URL relative to its own mount point.
//! Fully-qualified request targets (`http://host/api/users`) keep their
//! scheme and host untouched; only the path after them is rewritten.

/// Returns the scheme and host of a fully-qualified URL.
///
/// `None` for origin-form targets (`/path`), for URLs with a `?` before the
/// `://`, and for URLs with no path after the host.
pub fn protohost(url: &str) -> Option<&str> {
    if url.is_empty() || url.starts_with('/') {
        return None;
    }

    let scheme_end = url.find("://")?;
    if url[..scheme_end].contains('?') {
        return None;
    }

    let host_start = scheme_end + 3;
    url[host_start..]
        .find('/')
        .map(|slash| &url[..host_start + slash])
}

/// The path component of a URL, without protohost, query or fragment.
pub fn pathname(url: &str) -> &str {
    let rest = match protohost(url) {
        Some(protohost) => &url[protohost.len()..],
        None if is_fully_qualified(url) => return "/",
        None => url,
    };

    let end = rest.find(|c| c == '?' || c == '#').unwrap_or(rest.len());
    match &rest[..end] {
        "" => "/",
        path => path,
    }
}

fn is_fully_qualified(url: &str) -> bool {
    !url.starts_with('/')
        && url
            .find("://")
            .map_or(false, |scheme_end| !url[..scheme_end].contains('?'))
}

/// Whether `path` lies inside the mount `prefix`.
///
/// The comparison ignores ASCII case, and the character right after the
/// prefix must be `/`, `.` or the end of the path: `/foo` matches `/foo`,
/// `/foo/bar` and `/foo.json` but not `/foobar`.
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    let (path, prefix) = (path.as_bytes(), prefix.as_bytes());
    if path.len() < prefix.len() || !path[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return false;
    }

    matches!(path.get(prefix.len()), None | Some(b'/') | Some(b'.'))
}

/// A URL with a mount prefix removed, plus what is needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripped {
    /// The rewritten URL.
    pub url: String,
    /// The exact text taken out of the URL.
    pub removed: String,
    /// Whether a `/` was inserted to keep the URL rooted.
    pub slash_added: bool,
}

/// Removes `prefix_len` bytes of path from `url`, right after `protohost`.
///
/// The caller has already checked the prefix with [`matches_prefix`], so the
/// removed bytes are the prefix as it is spelled in the URL. The case of the
/// URL is kept, which is what makes [`restore`] an exact inverse.
pub fn strip(url: &str, prefix_len: usize, protohost: &str) -> Stripped {
    let cut = (protohost.len() + prefix_len).min(url.len());
    let removed = url.get(protohost.len()..cut).unwrap_or_default().to_owned();
    let mut rewritten = format!("{}{}", protohost, url.get(cut..).unwrap_or_default());

    let slash_added = protohost.is_empty() && !rewritten.starts_with('/');
    if slash_added {
        rewritten.insert(0, '/');
    }

    Stripped {
        url: rewritten,
        removed,
        slash_added,
    }
}

/// Undoes [`strip`]: drops the synthetic `/` and re-inserts the removed text.
pub fn restore(url: &str, removed: &str, protohost: &str, slash_added: bool) -> String {
    let url = if slash_added {
        url.strip_prefix('/').unwrap_or(url)
    } else {
        url
    };

    if removed.is_empty() {
        return url.to_owned();
    }

    let split = protohost.len().min(url.len());
    format!(
        "{}{}{}",
        &url[..split],
        removed,
        url.get(split..).unwrap_or_default()
    )
}
