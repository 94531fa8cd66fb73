use std::collections::HashMap;
use std::path::Path;

/// Extension → content-type map, seeded with a built-in table and optionally
/// extended from a `mime.types`-style file (`type ext ext…` per line,
/// `#` comments). Read-only after startup.
#[derive(Debug, Clone)]
pub struct MimeTable {
    types: HashMap<String, String>,
    default_type: String,
}

const BUILTIN: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("txt", "text/plain"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("wasm", "application/wasm"),
    ("woff2", "font/woff2"),
];

impl MimeTable {
    pub fn new(default_type: &str) -> Self {
        let types = BUILTIN
            .iter()
            .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
            .collect();
        Self {
            types,
            default_type: default_type.to_string(),
        }
    }

    pub fn load(path: Option<&Path>, default_type: &str) -> std::io::Result<Self> {
        let mut table = Self::new(default_type);
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            table.merge(&content);
        }
        Ok(table)
    }

    fn merge(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim().trim_end_matches(';');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(mime) = parts.next() else { continue };
            for ext in parts {
                self.types.insert(ext.to_string(), mime.to_string());
            }
        }
    }

    /// Content type by the path's final extension, else the default type.
    pub fn lookup(&self, path: &Path) -> &str {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.types.get(&e.to_ascii_lowercase()))
            .map(|s| s.as_str())
            .unwrap_or(&self.default_type)
    }

    pub fn default_type(&self) -> &str {
        &self.default_type
    }
}
