use anyhow::{Context, Result};
use glob::Pattern;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Extensions (lowercase, with dot) considered indexable source/text.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".cpp", ".c", ".h", ".cs", ".php", ".rb",
    ".go", ".rs", ".swift", ".kt", ".scala", ".clj", ".hs", ".ml", ".elm", ".dart", ".r", ".m",
    ".mm", ".sh", ".bash", ".zsh", ".fish", ".ps1", ".bat", ".cmd", ".html", ".htm", ".xml",
    ".css", ".scss", ".sass", ".less", ".astro", ".vue", ".svelte", ".mjs", ".cjs", ".sql",
    ".yaml", ".yml", ".json", ".toml", ".ini", ".cfg", ".md", ".rst", ".txt", ".tex", ".org",
];

/// Generated lockfiles are pure noise for retrieval.
const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "composer.lock",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "go.sum",
];

/// Dot-named path components that are still allowed.
const HIDDEN_ALLOWED: &[&str] = &[".gitignore", ".env.example", ".editorconfig", ".nvmrc"];

/// Build/tool directory names skipped anywhere in the tree.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    "build",
    "dist",
    ".venv",
    "venv",
    ".env",
    "target",
    ".gradle",
    ".idea",
    ".vscode",
    ".vs",
    "bin",
    "obj",
    "logs",
    "tmp",
    "temp",
    "coverage",
    ".nyc_output",
    ".pytest_cache",
    "__tests__",
    "test-results",
    "dist-ssr",
    ".astro",
];

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    /// Root-relative path, normalized to forward slashes.
    pub rel_path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub max_file_bytes: u64,
}

/// One parsed `.gitignore` line.
///
/// Only the simple subset is honoured: patterns ending in `/` match
/// directory components by basename; everything else matches the full
/// relative path or the basename with shell-glob semantics. Negation and
/// nested `.gitignore` files are deliberately not supported.
#[derive(Debug, Clone)]
struct IgnoreGlob {
    pattern: Pattern,
    dir_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GitignoreRules {
    globs: Vec<IgnoreGlob>,
}

impl GitignoreRules {
    /// Parse the root-level `.gitignore` if present; missing or unreadable
    /// files yield an empty rule set.
    pub fn load(root: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(root.join(".gitignore")) else {
            return Self::default();
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Self {
        let mut globs = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let dir_only = line.ends_with('/');
            let raw = if dir_only { line.trim_end_matches('/') } else { line };
            if let Ok(pattern) = Pattern::new(raw) {
                globs.push(IgnoreGlob { pattern, dir_only });
            }
        }
        Self { globs }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        if self.globs.is_empty() {
            return false;
        }
        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
        for glob in &self.globs {
            if glob.dir_only {
                if rel_path.split('/').any(|part| glob.pattern.matches(part)) {
                    return true;
                }
            } else if glob.pattern.matches(rel_path) || glob.pattern.matches(basename) {
                return true;
            }
        }
        false
    }
}

fn has_source_extension(rel_path: &str) -> bool {
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let Some(dot) = basename.rfind('.') else {
        return false;
    };
    if dot == 0 {
        // ".gitignore" style names have no extension, only a hidden prefix.
        return false;
    }
    let ext = basename[dot..].to_ascii_lowercase();
    SOURCE_EXTENSIONS.contains(&ext.as_str())
}

/// Apply every path-shaped inclusion rule (everything except the size cap,
/// which needs a `stat`).
pub fn matches_filters(rel_path: &str, gitignore: &GitignoreRules) -> bool {
    if !has_source_extension(rel_path) {
        return false;
    }

    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    if LOCKFILES.contains(&basename) {
        return false;
    }

    for part in rel_path.split('/') {
        if part.starts_with('.') && !HIDDEN_ALLOWED.contains(&part) {
            return false;
        }
        if EXCLUDED_DIRS.contains(&part) {
            return false;
        }
    }

    if gitignore.is_ignored(rel_path) {
        return false;
    }

    true
}

/// Enumerate every included file under the root, sorted by relative path.
///
/// Unreadable directory entries and files that fail `stat` are silently
/// skipped; the caller only ever sees files it can try to read.
pub fn scan_tree(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    std::fs::metadata(&opts.root)
        .with_context(|| format!("Root does not exist: {}", opts.root.display()))?;

    let gitignore = GitignoreRules::load(&opts.root);

    let walker = WalkBuilder::new(&opts.root)
        // All filtering is our own: only the root .gitignore is honoured,
        // with simple glob semantics, never the full nested-ignore rules.
        .standard_filters(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) && entry.depth() > 0 {
                return !EXCLUDED_DIRS.contains(&name.as_ref())
                    && !(name.starts_with('.') && !HIDDEN_ALLOWED.contains(&name.as_ref()));
            }
            true
        })
        .build();

    let mut entries = Vec::new();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        let rel_path = match abs_path.strip_prefix(&opts.root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        if !matches_filters(&rel_path, &gitignore) {
            continue;
        }

        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if bytes > opts.max_file_bytes {
            continue;
        }

        entries.push(FileEntry {
            abs_path,
            rel_path,
            bytes,
        });
    }

    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_ignore() -> GitignoreRules {
        GitignoreRules::default()
    }

    #[test]
    fn extension_allow_list_is_case_insensitive() {
        assert!(matches_filters("src/main.RS", &no_ignore()));
        assert!(matches_filters("docs/README.md", &no_ignore()));
        assert!(!matches_filters("assets/logo.png", &no_ignore()));
        assert!(!matches_filters("Makefile", &no_ignore()));
    }

    #[test]
    fn lockfiles_are_rejected_despite_matching_extension() {
        assert!(!matches_filters("package-lock.json", &no_ignore()));
        assert!(!matches_filters("sub/dir/yarn.lock", &no_ignore()));
        assert!(matches_filters("package.json", &no_ignore()));
    }

    #[test]
    fn hidden_components_are_rejected_unless_allowed() {
        assert!(!matches_filters(".github/workflows/ci.yml", &no_ignore()));
        assert!(!matches_filters("src/.secret.json", &no_ignore()));
        // Allowed hidden names still fail the extension rule, matching the
        // original filter order.
        assert!(!matches_filters(".gitignore", &no_ignore()));
    }

    #[test]
    fn build_directories_are_rejected_anywhere_in_the_path() {
        assert!(!matches_filters("node_modules/lib/index.js", &no_ignore()));
        assert!(!matches_filters("service/target/debug/out.rs", &no_ignore()));
        assert!(!matches_filters("web/dist/app.js", &no_ignore()));
        assert!(matches_filters("service/src/lib.rs", &no_ignore()));
    }

    #[test]
    fn gitignore_dir_patterns_match_components_by_basename() {
        let rules = GitignoreRules::parse("generated/\n");
        assert!(rules.is_ignored("app/generated/schema.ts"));
        assert!(rules.is_ignored("generated/mod.rs"));
        assert!(!rules.is_ignored("app/src/generated.rs"));
    }

    #[test]
    fn gitignore_file_patterns_match_full_path_or_basename() {
        let rules = GitignoreRules::parse("*.log\nsecret.yaml\n# comment\n\n");
        assert!(rules.is_ignored("debug.log"));
        assert!(rules.is_ignored("nested/deep/trace.log"));
        assert!(rules.is_ignored("config/secret.yaml"));
        assert!(!rules.is_ignored("config/public.yaml"));
    }

    #[test]
    fn size_cap_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let at_cap = dir.path().join("at_cap.txt");
        let over_cap = dir.path().join("over_cap.txt");
        std::fs::write(&at_cap, vec![b'a'; 1024]).unwrap();
        std::fs::write(&over_cap, vec![b'a'; 1025]).unwrap();

        let entries = scan_tree(&ScanOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1024,
        })
        .unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(names, vec!["at_cap.txt"]);
    }

    #[test]
    fn scan_output_is_sorted_by_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/one.rs"), "fn b() {}\n").unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("z.py"), "z = 1\n").unwrap();

        let entries = scan_tree(&ScanOptions {
            root: dir.path().to_path_buf(),
            max_file_bytes: 1024 * 1024,
        })
        .unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(names, vec!["a.rs", "b/one.rs", "z.py"]);
    }
}
