//! Code navigation tools: definitions, usages and enclosing context.
//!
//! These work lexically. The identifier under the cursor is the symbol, and
//! definition sites are lines where it follows a declaration keyword. Files
//! are scanned in path order with the requested file first.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};
use crate::mcp::handler::{
    error_result, get_bool_arg, get_optional_int_arg, get_string_arg, structured_result, Arguments,
    ToolHandler,
};
use crate::mcp::router::Workspace;

pub const FIND_DEFINITION: &str = "find_definition";
pub const FIND_USAGES: &str = "find_usages";
pub const GET_CONTAINING_CONTEXT: &str = "get_containing_context";

const INVALID_LOCATION: &str = "Invalid file_path/line/column";
const DEFAULT_USAGE_LIMIT: i64 = 100;
const MAX_USAGE_LIMIT: i64 = 500;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

const DECLARATION_KEYWORDS: &str =
    "fn|struct|class|def|function|interface|fun|func|type|enum|trait|const|val|var|let|static|mod|object";

const IGNORED_DIRS: &[&str] = &["target", "node_modules", "build", "dist"];

/// Input schema shared by all three tools.
pub fn location_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "file_path": { "type": "string" },
            "line": { "type": "integer" },
            "column": { "type": "integer" },
            "include_declaration": { "type": "boolean" },
            "limit": { "type": "integer" }
        },
        "required": ["file_path", "line"]
    })
}

/// A 1-based position in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file_path: String,
    pub line: usize,
    pub column: usize,
}

/// The position a tool call points at.
#[derive(Debug)]
struct ResolvedLocation {
    path: PathBuf,
    lines: Vec<String>,
    line: usize,
    /// As requested, before clamping to the line.
    column: usize,
    symbol: Option<String>,
}

impl ResolvedLocation {
    fn display_path(&self) -> String {
        display_path(&self.path)
    }
}

// ===== Tool handlers =====

/// Go to the definition of the symbol at a position.
pub struct FindDefinitionTool;

#[async_trait]
impl ToolHandler for FindDefinitionTool {
    async fn invoke(&self, workspace: &Workspace, arguments: Arguments) -> Result<Value> {
        let root = workspace.root.clone();
        let found = run_blocking(move || {
            let Some(location) = resolve_location(&root, &arguments) else {
                return Ok(None);
            };
            Ok(Some(find_definition(&root, &location)))
        })
        .await?;

        match found {
            None => error_result(INVALID_LOCATION),
            Some(None) => error_result("Definition not found"),
            Some(Some(definition)) => structured_result(
                format!(
                    "definition file={} line={} column={}",
                    definition.file_path, definition.line, definition.column
                ),
                serde_json::to_value(&definition)?,
            ),
        }
    }
}

/// Find whole-word usages of the symbol at a position.
pub struct FindUsagesTool;

#[async_trait]
impl ToolHandler for FindUsagesTool {
    async fn invoke(&self, workspace: &Workspace, arguments: Arguments) -> Result<Value> {
        let include_declaration = get_bool_arg(&arguments, "include_declaration", false);
        let limit = get_optional_int_arg(&arguments, "limit")
            .unwrap_or(DEFAULT_USAGE_LIMIT)
            .clamp(1, MAX_USAGE_LIMIT) as usize;

        let root = workspace.root.clone();
        let usages = run_blocking(move || {
            let Some(location) = resolve_location(&root, &arguments) else {
                return Ok(None);
            };
            Ok(Some(find_usages(&root, &location, include_declaration, limit)))
        })
        .await?;

        let Some(usages) = usages else {
            return error_result(INVALID_LOCATION);
        };
        structured_result(
            format!("usages={}", usages.len()),
            json!({ "count": usages.len(), "items": usages }),
        )
    }
}

/// Describe the nearest enclosing declaration of a position.
pub struct ContainingContextTool;

#[async_trait]
impl ToolHandler for ContainingContextTool {
    async fn invoke(&self, workspace: &Workspace, arguments: Arguments) -> Result<Value> {
        let root = workspace.root.clone();
        let context = run_blocking(move || {
            Ok(resolve_location(&root, &arguments).map(|location| containing_context(&location)))
        })
        .await?;

        match context {
            None => error_result(INVALID_LOCATION),
            Some(context) => structured_result(context.clone(), json!({ "context": context })),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::ToolExecutionFailed(e.to_string()))?
}

// ===== Location resolution =====

/// Resolve `file_path`/`line`/`column` against the workspace root.
fn resolve_location(root: &Path, arguments: &Arguments) -> Option<ResolvedLocation> {
    let file_path = get_string_arg(arguments, "file_path").ok()?;
    let line = usize::try_from(get_optional_int_arg(arguments, "line")?).ok()?;
    let column = match get_optional_int_arg(arguments, "column") {
        Some(c) if c > 0 => usize::try_from(c).ok()?,
        _ => 1,
    };

    let path = resolve_file_path(root, &file_path)?;
    let lines = read_lines(&path)?;
    if line == 0 || line > lines.len() {
        return None;
    }

    let symbol = identifier_at(&lines[line - 1], column - 1);
    Some(ResolvedLocation {
        path,
        lines,
        line,
        column,
        symbol,
    })
}

/// Accepts absolute paths, workspace-relative paths and `file://` URLs.
fn resolve_file_path(root: &Path, file_path: &str) -> Option<PathBuf> {
    let normalized = file_path.trim().replace('\\', "/");
    if normalized.is_empty() {
        return None;
    }

    let raw = if normalized.contains("://") {
        normalized.strip_prefix("file://")?.to_string()
    } else {
        normalized
    };

    let candidate = Path::new(&raw);
    let path = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    path.is_file().then_some(path)
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    let metadata = fs::metadata(path).ok()?;
    if metadata.len() > MAX_FILE_BYTES {
        return None;
    }
    let content = fs::read_to_string(path).ok()?;
    Some(content.lines().map(String::from).collect())
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// The identifier covering char offset `offset`, clamped to the line. A cursor
/// just past the end of an identifier still selects it.
fn identifier_at(line: &str, offset: usize) -> Option<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return None;
    }

    let mut at = offset.min(chars.len() - 1);
    if !is_identifier_char(chars[at]) {
        if at > 0 && is_identifier_char(chars[at - 1]) {
            at -= 1;
        } else {
            return None;
        }
    }

    let mut start = at;
    while start > 0 && is_identifier_char(chars[start - 1]) {
        start -= 1;
    }
    let mut end = at + 1;
    while end < chars.len() && is_identifier_char(chars[end]) {
        end += 1;
    }

    let ident: String = chars[start..end].iter().collect();
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(ident)
}

// ===== Searches =====

fn definition_regex(symbol: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"\b(?:{})\s+(?:mut\s+)?({})\b",
        DECLARATION_KEYWORDS,
        regex::escape(symbol)
    ))
    .ok()
}

fn usage_regex(symbol: &str) -> Option<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(symbol))).ok()
}

fn any_declaration_regex() -> Option<Regex> {
    Regex::new(&format!(
        r"\b({})\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)",
        DECLARATION_KEYWORDS
    ))
    .ok()
}

fn find_definition(root: &Path, location: &ResolvedLocation) -> Option<Location> {
    let symbol = location.symbol.as_deref()?;
    let pattern = definition_regex(symbol)?;

    search_order(root, &location.path).find_map(|path| {
        let lines = if path == location.path {
            location.lines.clone()
        } else {
            read_lines(&path)?
        };
        lines.iter().enumerate().find_map(|(idx, line)| {
            let name = pattern.captures(line)?.get(1)?;
            Some(Location {
                file_path: display_path(&path),
                line: idx + 1,
                column: char_column(line, name.start()),
            })
        })
    })
}

fn find_usages(
    root: &Path,
    location: &ResolvedLocation,
    include_declaration: bool,
    limit: usize,
) -> Vec<Location> {
    let mut usages = Vec::new();
    let Some(symbol) = location.symbol.as_deref() else {
        return usages;
    };
    let (Some(usage), Some(definition)) = (usage_regex(symbol), definition_regex(symbol)) else {
        return usages;
    };

    if include_declaration {
        if let Some(declaration) = find_definition(root, location) {
            usages.push(declaration);
        }
    }

    for path in search_order(root, &location.path) {
        if usages.len() >= limit {
            break;
        }
        let lines = if path == location.path {
            location.lines.clone()
        } else {
            match read_lines(&path) {
                Some(lines) => lines,
                None => continue,
            }
        };

        for (idx, line) in lines.iter().enumerate() {
            let declared_at: Vec<usize> = definition
                .captures_iter(line)
                .filter_map(|c| c.get(1).map(|m| m.start()))
                .collect();

            for hit in usage.find_iter(line) {
                if declared_at.contains(&hit.start()) {
                    continue;
                }
                usages.push(Location {
                    file_path: display_path(&path),
                    line: idx + 1,
                    column: char_column(line, hit.start()),
                });
                if usages.len() >= limit {
                    return usages;
                }
            }
        }
    }

    usages
}

fn containing_context(location: &ResolvedLocation) -> String {
    let enclosing = any_declaration_regex().and_then(|pattern| {
        location.lines[..location.line]
            .iter()
            .rev()
            .find_map(|line| {
                let captures = pattern.captures(line)?;
                Some((
                    captures.get(1)?.as_str().to_string(),
                    captures.get(2)?.as_str().to_string(),
                ))
            })
    });

    let (kind, name) = enclosing.unwrap_or_else(|| {
        let file_name = location
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| location.display_path());
        ("file".to_string(), file_name)
    });

    format!(
        "context={} name={} file={} line={} column={}",
        kind,
        name,
        location.display_path(),
        location.line,
        location.column
    )
}

/// The requested file, then every other workspace file in path order.
fn search_order<'a>(root: &Path, first: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
    let rest = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
        .filter(move |p| p != first);

    std::iter::once(first.to_path_buf()).chain(rest)
}

fn is_ignored(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && IGNORED_DIRS.contains(&name.as_ref()))
}

fn char_column(line: &str, byte_offset: usize) -> usize {
    line[..byte_offset].chars().count() + 1
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace(dir: &TempDir) -> Workspace {
        Workspace {
            path: display_path(dir.path()),
            root: dir.path().to_path_buf(),
        }
    }

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn helper(x: i32) -> i32 {\n    x + 1\n}\n\npub fn caller() -> i32 {\n    helper(1) + helper(2)\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("src/main.rs"),
            "fn main() {\n    let v = helper(3);\n    println!(\"{}\", v);\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("target/generated.rs"),
            "fn helper() {}\nhelper();\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_identifier_at() {
        assert_eq!(identifier_at("    helper(1)", 6), Some("helper".to_string()));
        assert_eq!(identifier_at("    helper(1)", 10), Some("helper".to_string()));
        assert_eq!(identifier_at("    helper(1)", 0), None);
        assert_eq!(identifier_at("x", 50), Some("x".to_string()));
        assert_eq!(identifier_at("", 0), None);
        assert_eq!(identifier_at("  42 ", 2), None);
    }

    #[test]
    fn test_resolve_file_path_variants() {
        let dir = fixture();
        let root = dir.path();
        let absolute = root.join("src/lib.rs");

        assert_eq!(resolve_file_path(root, "src/lib.rs"), Some(absolute.clone()));
        assert_eq!(
            resolve_file_path(root, &absolute.to_string_lossy()),
            Some(absolute.clone())
        );
        assert_eq!(
            resolve_file_path(root, &format!("file://{}", absolute.to_string_lossy())),
            Some(absolute)
        );
        assert_eq!(resolve_file_path(root, "src/missing.rs"), None);
        assert_eq!(resolve_file_path(root, "http://example.com/x.rs"), None);
        assert_eq!(resolve_file_path(root, "  "), None);
    }

    #[test]
    fn test_resolve_location_validates_line() {
        let dir = fixture();
        let root = dir.path();

        assert!(resolve_location(root, &args(json!({"file_path": "src/lib.rs", "line": 0}))).is_none());
        assert!(resolve_location(root, &args(json!({"file_path": "src/lib.rs", "line": 99}))).is_none());
        assert!(resolve_location(root, &args(json!({"line": 1}))).is_none());
        assert!(resolve_location(root, &args(json!({"file_path": 7, "line": 1}))).is_none());

        let loc = resolve_location(
            root,
            &args(json!({"file_path": "src/lib.rs", "line": 6, "column": 5})),
        )
        .unwrap();
        assert_eq!(loc.symbol.as_deref(), Some("helper"));
        assert_eq!(loc.column, 5);

        let clamped = resolve_location(
            root,
            &args(json!({"file_path": "src/lib.rs", "line": 2, "column": 400})),
        )
        .unwrap();
        assert_eq!(clamped.symbol, None);
        assert_eq!(clamped.column, 400);
    }

    #[tokio::test]
    async fn test_find_definition() {
        let dir = fixture();
        let result = FindDefinitionTool
            .invoke(
                &workspace(&dir),
                args(json!({"file_path": "src/main.rs", "line": 2, "column": 13})),
            )
            .await
            .unwrap();

        assert_eq!(result["isError"], json!(false));
        let structured = &result["structuredContent"];
        assert!(structured["file_path"].as_str().unwrap().ends_with("src/lib.rs"));
        assert_eq!(structured["line"], json!(1));
        assert_eq!(structured["column"], json!(8));
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("definition file="));
    }

    #[tokio::test]
    async fn test_find_definition_not_found() {
        let dir = fixture();
        let result = FindDefinitionTool
            .invoke(
                &workspace(&dir),
                args(json!({"file_path": "src/main.rs", "line": 3, "column": 5})),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["content"][0]["text"], json!("Definition not found"));
    }

    #[tokio::test]
    async fn test_invalid_location_is_tool_error() {
        let dir = fixture();
        let result = FindUsagesTool
            .invoke(&workspace(&dir), args(json!({"file_path": "nope.rs", "line": 1})))
            .await
            .unwrap();
        assert_eq!(result["isError"], json!(true));
        assert_eq!(result["content"][0]["text"], json!(INVALID_LOCATION));
    }

    #[tokio::test]
    async fn test_find_usages_skips_declaration_and_ignored_dirs() {
        let dir = fixture();
        let result = FindUsagesTool
            .invoke(
                &workspace(&dir),
                args(json!({"file_path": "src/lib.rs", "line": 1, "column": 8})),
            )
            .await
            .unwrap();

        let structured = &result["structuredContent"];
        assert_eq!(structured["count"], json!(3));
        assert_eq!(result["content"][0]["text"], json!("usages=3"));
        let items = structured["items"].as_array().unwrap();
        assert!(items
            .iter()
            .all(|i| !i["file_path"].as_str().unwrap().contains("target/")));
        assert!(!items.iter().any(|i| i["line"] == json!(1)
            && i["file_path"].as_str().unwrap().ends_with("lib.rs")));
    }

    #[tokio::test]
    async fn test_find_usages_with_declaration_and_limit() {
        let dir = fixture();
        let ws = workspace(&dir);

        let with_decl = FindUsagesTool
            .invoke(
                &ws,
                args(json!({"file_path": "src/lib.rs", "line": 1, "column": 8, "include_declaration": "true"})),
            )
            .await
            .unwrap();
        assert_eq!(with_decl["structuredContent"]["count"], json!(4));
        assert_eq!(with_decl["structuredContent"]["items"][0]["line"], json!(1));

        let limited = FindUsagesTool
            .invoke(
                &ws,
                args(json!({"file_path": "src/lib.rs", "line": 1, "column": 8, "limit": 0})),
            )
            .await
            .unwrap();
        assert_eq!(limited["structuredContent"]["count"], json!(1));
    }

    #[tokio::test]
    async fn test_containing_context() {
        let dir = fixture();
        let ws = workspace(&dir);

        let result = ContainingContextTool
            .invoke(&ws, args(json!({"file_path": "src/lib.rs", "line": 6, "column": 5})))
            .await
            .unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("context=fn name=caller file="));
        assert!(text.ends_with("line=6 column=5"));
        assert_eq!(result["structuredContent"]["context"], json!(text));
    }

    #[tokio::test]
    async fn test_containing_context_falls_back_to_file() {
        let dir = fixture();
        fs::write(dir.path().join("notes.txt"), "just words\n").unwrap();

        let result = ContainingContextTool
            .invoke(&workspace(&dir), args(json!({"file_path": "notes.txt", "line": 1})))
            .await
            .unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("context=file name=notes.txt"));
        assert!(text.ends_with("line=1 column=1"));
    }
}
