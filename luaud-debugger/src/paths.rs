//! Path mapper: canonical identities for script sources.
//!
//! The VM hands out chunk names with compiler prefixes (`@file`,
//! `=file`) and whatever separators the host platform uses. Breakpoint
//! bookkeeping needs one canonical spelling per file, so every source
//! identifier entering the adapter goes through [`PathMapper::normalize`]
//! first. Equality of script identifiers is exactly equality of the
//! normalized strings.

use std::path::{Component, Path, PathBuf};

/// Normalizes raw script identifiers into canonical absolute paths.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    root: Option<PathBuf>,
    extension: String,
}

impl PathMapper {
    pub fn new(root: Option<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root,
            extension: extension.into(),
        }
    }

    /// Update the resolution root for relative identifiers.
    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = Some(root.into());
    }

    /// Canonicalize a raw source identifier.
    ///
    /// Strips a leading `@` or `=`, converts backslashes, resolves the
    /// identifier against the configured root when relative, appends the
    /// default script extension when none is present, and collapses
    /// `.`/`..` components lexically (files are not required to exist).
    pub fn normalize(&self, raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }
        let stripped = raw.strip_prefix(['@', '=']).unwrap_or(raw);
        let mut text = stripped.replace('\\', "/");

        let has_extension = Path::new(&text)
            .extension()
            .is_some_and(|ext| !ext.is_empty());
        if !has_extension && !self.extension.is_empty() {
            text.push_str(&self.extension);
        }

        let mut path = PathBuf::from(&text);
        if path.is_relative() {
            if let Some(root) = &self.root {
                path = root.join(path);
            }
        }

        normalize_components(&path)
    }
}

/// Lexical `weakly_canonical`: resolves `.` and `..` without touching
/// the filesystem, then renders with forward slashes.
fn normalize_components(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => {
                prefix = p.as_os_str().to_string_lossy().replace('\\', "/");
            }
            Component::RootDir => {
                parts.clear();
                prefix.push('/');
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() && prefix.is_empty() {
                    // Relative path escaping its base; keep the component.
                    parts.push("..".to_string());
                }
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }
    format!("{prefix}{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapper() -> PathMapper {
        PathMapper::new(Some(PathBuf::from("/scripts")), ".lua")
    }

    #[test]
    fn strips_chunk_prefixes() {
        assert_eq!(mapper().normalize("@/scripts/main.lua"), "/scripts/main.lua");
        assert_eq!(mapper().normalize("=/scripts/main.lua"), "/scripts/main.lua");
    }

    #[test]
    fn resolves_relative_against_root() {
        assert_eq!(mapper().normalize("main.lua"), "/scripts/main.lua");
        assert_eq!(mapper().normalize("lib/util.lua"), "/scripts/lib/util.lua");
    }

    #[test]
    fn appends_default_extension() {
        assert_eq!(mapper().normalize("main"), "/scripts/main.lua");
        assert_eq!(mapper().normalize("/scripts/main"), "/scripts/main.lua");
    }

    #[test]
    fn converts_backslashes() {
        assert_eq!(
            mapper().normalize("@lib\\nested\\mod.lua"),
            "/scripts/lib/nested/mod.lua"
        );
    }

    #[test]
    fn collapses_dot_components() {
        assert_eq!(
            mapper().normalize("/scripts/lib/../main.lua"),
            "/scripts/main.lua"
        );
        assert_eq!(mapper().normalize("/scripts/./main.lua"), "/scripts/main.lua");
    }

    #[test]
    fn normalization_is_idempotent() {
        let mapper = mapper();
        for raw in ["@main", "lib\\x.lua", "/scripts/a/../b/c.lua", "main.lua"] {
            let once = mapper.normalize(raw);
            assert_eq!(mapper.normalize(&once), once);
        }
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(mapper().normalize(""), "");
    }
}
