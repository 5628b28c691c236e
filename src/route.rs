// src/route.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const MAX_KEY_LEN: usize = 1024;

/// Immutable after startup; the internal representation is deliberately a
/// plain map rather than a trie since no param/wildcard matching is needed.
pub struct RouteTable {
    routes: HashMap<String, PathBuf>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Inserts a public path -> filesystem path mapping. Collisions overwrite.
    /// Keys over `MAX_KEY_LEN` bytes are dropped and logged.
    pub fn add(&mut self, public: impl Into<String>, fs_path: impl Into<PathBuf>) {
        let public = public.into();
        if public.len() > MAX_KEY_LEN {
            tracing::warn!(path_len = public.len(), "route key exceeds bound, dropping");
            return;
        }
        self.routes.insert(public, fs_path.into());
    }

    pub fn lookup(&self, public: &str) -> Option<&Path> {
        self.routes.get(public).map(PathBuf::as_path)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the fixed seed route table served at startup.
pub fn seed_routes(html_root: &Path) -> RouteTable {
    let mut routes = RouteTable::new();
    routes.add("/", html_root.join("index.html"));
    routes.add(
        "/apple-touch-icon.png",
        html_root.join("apple-touch-icon.png"),
    );
    routes.add("/favicon.png", html_root.join("favicon.png"));
    routes.add("/common.css", html_root.join("common.css"));
    routes.add("/test/test.html", html_root.join("test/test.html"));
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_routes_round_trip() {
        let root = Path::new("html");
        let routes = seed_routes(root);
        assert_eq!(routes.lookup("/"), Some(root.join("index.html").as_path()));
        assert_eq!(
            routes.lookup("/common.css"),
            Some(root.join("common.css").as_path())
        );
        assert_eq!(routes.lookup("/nope"), None);
    }

    #[test]
    fn add_overwrites_on_collision() {
        let mut routes = RouteTable::new();
        routes.add("/x", "first");
        routes.add("/x", "second");
        assert_eq!(routes.lookup("/x"), Some(Path::new("second")));
    }

    #[test]
    fn oversized_key_is_dropped() {
        let mut routes = RouteTable::new();
        let huge = "/".to_string() + &"a".repeat(MAX_KEY_LEN + 1);
        routes.add(huge.clone(), "somewhere");
        assert_eq!(routes.lookup(&huge), None);
    }
}
