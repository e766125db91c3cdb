//! Plugin registration by entry-point rewriting.
//!
//! The Core registers plugins through side-effect imports: a blank import
//! (`_ "package/path"`) in its entry-point source pulls the plugin's `init`
//! into the binary. This module parses the entry point's import
//! declarations, adds the requested blank imports, and prints the result
//! back. The rendered file is staged in memory first so a printing failure
//! can never leave a truncated source file on disk.

use camino::Utf8Path;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, eyre},
};
use tracing::{debug, instrument};

use crate::fs;

/// Mode of the rewritten entry point.
const ENTRY_MODE: u32 = 0o660;

/// The discarded-name sentinel used for side-effect-only imports.
const BLANK: &str = "_";

/// One import declaration: optional local binding plus quoted path.
#[derive(Clone, Eq, PartialEq, Debug)]
struct ImportSpec {
    name: Option<String>,
    path: String,
}

/// The parsed shape of the entry point, as far as injection cares: the
/// package clause, the grouped import declaration (if any), and every
/// import spec in the file.
#[derive(Debug)]
struct EntryPoint<'a> {
    lines: Vec<&'a str>,
    package_clause: usize,
    /// Index of the grouped declaration's closing parenthesis.
    block_close: Option<usize>,
    specs: Vec<ImportSpec>,
}

impl<'a> EntryPoint<'a> {
    fn parse(source: &'a str) -> Result<Self> {
        let lines: Vec<&str> = source.split('\n').collect();
        let package_clause = lines
            .iter()
            .position(|line| line.trim_start().starts_with("package "))
            .ok_or_eyre("entry point has no package clause")?;

        let mut specs = Vec::new();
        let mut block_close = None;
        let mut in_block = false;
        for (index, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if in_block {
                if trimmed == ")" {
                    in_block = false;
                    if block_close.is_none() {
                        block_close = Some(index);
                    }
                    continue;
                }
                if let Some(spec) = parse_spec(trimmed) {
                    specs.push(spec);
                }
            } else if trimmed == "import (" || trimmed.starts_with("import (") {
                in_block = true;
            } else if let Some(rest) = trimmed.strip_prefix("import ") {
                if let Some(spec) = parse_spec(rest.trim()) {
                    specs.push(spec);
                }
            }
        }
        if in_block {
            return Err(eyre!("unterminated import declaration"));
        }

        Ok(Self {
            lines,
            package_clause,
            block_close,
            specs,
        })
    }

    fn has_blank_import(&self, package: &str) -> bool {
        self.specs
            .iter()
            .any(|spec| spec.name.as_deref() == Some(BLANK) && spec.path == package)
    }

    /// Print the file with blank imports added for `missing`, preserving
    /// every existing line byte-for-byte.
    fn render(&self, missing: &[&str]) -> String {
        let mut out: Vec<String> = Vec::with_capacity(self.lines.len() + missing.len() + 3);
        match self.block_close {
            Some(close) => {
                for (index, line) in self.lines.iter().enumerate() {
                    if index == close {
                        for package in missing {
                            out.push(format!("\t{BLANK} \"{package}\""));
                        }
                    }
                    out.push((*line).to_string());
                }
            }
            None => {
                for (index, line) in self.lines.iter().enumerate() {
                    out.push((*line).to_string());
                    if index == self.package_clause {
                        out.push(String::new());
                        out.push(String::from("import ("));
                        for package in missing {
                            out.push(format!("\t{BLANK} \"{package}\""));
                        }
                        out.push(String::from(")"));
                    }
                }
            }
        }
        out.join("\n")
    }
}

/// Parse one import spec: an optional binding name followed by a quoted
/// path. Comment and blank lines yield `None`.
fn parse_spec(line: &str) -> Option<ImportSpec> {
    if line.is_empty() || line.starts_with("//") {
        return None;
    }
    let open = line.find('"')?;
    let close = line[open + 1..].find('"')? + open + 1;
    let path = line[open + 1..close].to_string();
    let name = line[..open].trim();
    let name = (!name.is_empty()).then(|| name.to_string());
    Some(ImportSpec { name, path })
}

/// Render `source` with a blank import added for each package. Packages
/// whose blank import already exists are left alone; when nothing is
/// missing the source is returned unchanged.
pub fn render(source: &str, packages: &[String]) -> Result<String> {
    let entry = EntryPoint::parse(source)?;
    let mut missing: Vec<&str> = Vec::new();
    for package in packages {
        if !entry.has_blank_import(package) && !missing.contains(&package.as_str()) {
            missing.push(package);
        }
    }
    if missing.is_empty() {
        return Ok(source.to_string());
    }
    Ok(entry.render(&missing))
}

/// Inject blank imports into the entry-point file on disk.
///
/// The rewrite is atomic with respect to the file: it either keeps its
/// original contents (nothing missing, or any failure before the write) or
/// contains the fully printed result with mode 0660.
#[instrument]
pub async fn inject_file(path: &Utf8Path, packages: &[String]) -> Result<()> {
    let source = fs::read_utf8(path)
        .await
        .with_context(|| format!("read entry point: {path}"))?
        .ok_or_else(|| eyre!("entry point does not exist: {path}"))?;

    let rendered = render(&source, packages).with_context(|| format!("rewrite imports: {path}"))?;
    if rendered == source {
        debug!(%path, "entry point already imports every plugin");
        return Ok(());
    }

    fs::write_with_mode(path, rendered.as_bytes(), ENTRY_MODE)
        .await
        .with_context(|| format!("write entry point: {path}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ENTRY: &str = "package entry\n\nimport (\n\t\"errors\"\n\t\"fmt\"\n\n\t_ \"example.com/core/modules\"\n)\n\nfunc Run() {\n\tfmt.Println(errors.New(\"x\"))\n}\n";

    fn packages(paths: &[&str]) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn inserts_before_the_block_close() {
        let out = render(ENTRY, &packages(&["example.com/plugins/markdown"])).unwrap();
        assert!(out.contains("\t_ \"example.com/plugins/markdown\"\n)"));
        // Everything before the insertion point is untouched.
        assert!(out.starts_with("package entry\n\nimport (\n\t\"errors\"\n\t\"fmt\"\n"));
        assert!(out.ends_with("func Run() {\n\tfmt.Println(errors.New(\"x\"))\n}\n"));
    }

    #[test]
    fn injection_is_idempotent_to_the_byte() {
        let plugins = packages(&["example.com/plugins/markdown", "example.com/plugins/git"]);
        let once = render(ENTRY, &plugins).unwrap();
        let twice = render(&once, &plugins).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn existing_blank_import_is_a_noop() {
        let out = render(ENTRY, &packages(&["example.com/core/modules"])).unwrap();
        assert_eq!(out, ENTRY);
    }

    #[test]
    fn named_import_does_not_satisfy_a_blank_one() {
        let source = "package entry\n\nimport (\n\tm \"example.com/plugins/markdown\"\n)\n";
        let out = render(source, &packages(&["example.com/plugins/markdown"])).unwrap();
        assert!(out.contains("\tm \"example.com/plugins/markdown\""));
        assert!(out.contains("\t_ \"example.com/plugins/markdown\""));
    }

    #[test]
    fn creates_a_block_when_the_file_has_none() {
        let source = "package entry\n\nfunc Run() {}\n";
        let out = render(source, &packages(&["example.com/plugins/git"])).unwrap();
        assert_eq!(
            out,
            "package entry\n\nimport (\n\t_ \"example.com/plugins/git\"\n)\n\nfunc Run() {}\n",
        );
    }

    #[test]
    fn single_line_imports_are_recognized() {
        let source = "package entry\n\nimport _ \"example.com/plugins/git\"\n\nfunc Run() {}\n";
        let out = render(source, &packages(&["example.com/plugins/git"])).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn duplicate_requests_insert_once() {
        let plugins = packages(&["example.com/plugins/git", "example.com/plugins/git"]);
        let out = render(ENTRY, &plugins).unwrap();
        assert_eq!(out.matches("example.com/plugins/git").count(), 1);
    }

    #[test]
    fn missing_package_clause_is_an_error() {
        assert!(render("// just a comment\n", &packages(&["x"])).is_err());
    }

    #[tokio::test]
    async fn file_rewrite_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("run.go")).unwrap();
        tokio::fs::write(&path, ENTRY).await.unwrap();

        let plugins = packages(&["example.com/plugins/markdown"]);
        inject_file(&path, &plugins).await.expect("first injection");
        let first = tokio::fs::read_to_string(&path).await.unwrap();
        inject_file(&path, &plugins).await.expect("second injection");
        let second = tokio::fs::read_to_string(&path).await.unwrap();

        assert!(first.contains("_ \"example.com/plugins/markdown\""));
        assert_eq!(first, second);
    }
}
