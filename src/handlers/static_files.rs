use crate::prelude::*;

/// Result of mapping a request path onto the filesystem.
#[derive(Debug)]
pub enum Resolved {
    File(StaticFile),
    Status(u16),
}

#[derive(Debug)]
pub struct StaticFile {
    pub path: PathBuf,
    pub file: File,
    pub size: u64,
    pub mtime: SystemTime,
    pub content_type: String,
}

/// Map a normalized request path to a file under the server root.
///
/// Order: longest-prefix alias substitution, root join with an escape
/// check, index probing for directory requests, then the exact file with
/// the `try_files` fallback chain. Anything unmatched is a 404.
pub fn resolve(server: &ServerConfig, mime: &MimeTable, path: &str) -> Resolved {
    let aliased = apply_aliases(server, path);

    if aliased.ends_with('/') {
        let dir = match rooted_path(server, &aliased) {
            Some(p) => p,
            None => return Resolved::Status(403),
        };
        for index in &server.index {
            match open_regular(&dir.join(index), mime) {
                Probe::Hit(file) => return Resolved::File(file),
                Probe::Forbidden => return Resolved::Status(403),
                Probe::Miss => {}
            }
        }
        return Resolved::Status(404);
    }

    let candidate = match rooted_path(server, &aliased) {
        Some(p) => p,
        None => return Resolved::Status(403),
    };
    match open_regular(&candidate, mime) {
        Probe::Hit(file) => return Resolved::File(file),
        Probe::Forbidden => return Resolved::Status(403),
        Probe::Miss => {}
    }

    for pattern in &server.try_files {
        let uri = pattern.replace("$uri", path);
        let Some(fallback) = rooted_path(server, &uri) else {
            continue;
        };
        match open_regular(&fallback, mime) {
            Probe::Hit(file) => return Resolved::File(file),
            Probe::Forbidden => return Resolved::Status(403),
            Probe::Miss => {}
        }
    }

    Resolved::Status(404)
}

/// Longest-prefix alias substitution; the remainder after the prefix is
/// preserved.
fn apply_aliases(server: &ServerConfig, path: &str) -> String {
    let best = server
        .aliases
        .iter()
        .filter(|rule| path.starts_with(rule.prefix.as_str()))
        .max_by_key(|rule| rule.prefix.len());
    match best {
        Some(rule) => format!("{}{}", rule.target, &path[rule.prefix.len()..]),
        None => path.to_string(),
    }
}

/// Join a request path with the server root. Request paths are normalized
/// before they get here; alias targets come from config, so a parent
/// component at this point means the resolved path would leave the root.
fn rooted_path(server: &ServerConfig, uri: &str) -> Option<PathBuf> {
    let joined = server.root.join(uri.trim_start_matches('/'));
    if joined
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return None;
    }
    Some(joined)
}

enum Probe {
    Hit(StaticFile),
    Miss,
    Forbidden,
}

fn open_regular(path: &Path, mime: &MimeTable) -> Probe {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => return Probe::Forbidden,
        Err(_) => return Probe::Miss,
    };
    let meta = match file.metadata() {
        Ok(m) => m,
        Err(_) => return Probe::Miss,
    };
    if !meta.is_file() {
        return Probe::Miss;
    }
    Probe::Hit(StaticFile {
        content_type: mime.lookup(path).to_string(),
        path: path.to_path_buf(),
        size: meta.len(),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        file,
    })
}
