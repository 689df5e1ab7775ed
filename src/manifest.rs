use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::StageError;

/// A parsed `requirements.txt`-style dependency manifest.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    pub path: PathBuf,
    pub requirements: Vec<Requirement>,
    /// Option lines (`-r base.txt`, `--index-url ...`) forwarded to the installer untouched.
    pub options: Vec<String>,
    /// VCS, URL and local-path requirements with no `#egg=` name.
    pub references: Vec<String>,
    digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: String,
    pub line: usize,
}

impl Requirement {
    /// PEP 503 normalised distribution name.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Top-level module the distribution is conventionally imported as.
    pub fn import_root(&self) -> String {
        self.normalized_name().replace('-', "_")
    }
}

impl DependencyManifest {
    pub fn load(path: &Path, field: &str) -> Result<Self, StageError> {
        let content = fs::read_to_string(path).map_err(|err| {
            StageError::configuration(
                field,
                format!("Failed to read dependency manifest {}: {err}", path.display()),
            )
        })?;
        Self::parse(path, &content, field)
    }

    pub fn parse(path: &Path, content: &str, field: &str) -> Result<Self, StageError> {
        let mut requirements = Vec::new();
        let mut options = Vec::new();
        let mut references = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                options.push(line.to_string());
                continue;
            }
            if is_direct_reference(line) {
                match egg_name(line) {
                    Some(name) if is_valid_name(name) => requirements.push(Requirement {
                        name: name.to_string(),
                        constraint: line.to_string(),
                        line: line_no,
                    }),
                    Some(name) => {
                        return Err(StageError::configuration(
                            field,
                            format!(
                                "{}:{line_no}: invalid egg name '{name}' in '{line}'",
                                path.display()
                            ),
                        ));
                    }
                    None => references.push(line.to_string()),
                }
                continue;
            }

            let name_end = line
                .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
                .unwrap_or(line.len());
            let name = &line[..name_end];
            let rest = line[name_end..].trim();

            if !is_valid_name(name) {
                return Err(StageError::configuration(
                    field,
                    format!(
                        "{}:{line_no}: invalid requirement '{line}'",
                        path.display()
                    ),
                ));
            }
            if let Some(first) = rest.chars().next()
                && !matches!(first, '[' | '<' | '>' | '=' | '!' | '~' | ';' | '@' | '(')
            {
                return Err(StageError::configuration(
                    field,
                    format!(
                        "{}:{line_no}: unexpected '{first}' after requirement name '{name}'",
                        path.display()
                    ),
                ));
            }

            requirements.push(Requirement {
                name: name.to_string(),
                constraint: rest.to_string(),
                line: line_no,
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());

        Ok(Self {
            path: path.to_path_buf(),
            requirements,
            options,
            references,
            digest: format!("{:x}", hasher.finalize()),
        })
    }

    /// SHA-256 of the manifest bytes, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn import_roots(&self) -> Vec<String> {
        self.requirements.iter().map(Requirement::import_root).collect()
    }
}

pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_was_separator {
                normalized.push('-');
            }
            last_was_separator = true;
        } else {
            normalized.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        }
    }
    normalized
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

const VCS_PREFIXES: [&str; 4] = ["git+", "hg+", "svn+", "bzr+"];

/// URL, VCS or local-path requirement that the installer resolves itself.
fn is_direct_reference(line: &str) -> bool {
    if line.starts_with("./") || line.starts_with("../") || line.starts_with('/') {
        return true;
    }
    if VCS_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
        return true;
    }
    match line.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Name from an `#egg=name` fragment, stopping at the next `&`.
fn egg_name(line: &str) -> Option<&str> {
    let (_, fragment) = line.split_once("#egg=")?;
    let name = fragment.split(['&', ' ']).next().unwrap_or_default();
    Some(name)
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric(),
        _ => false,
    }
}
