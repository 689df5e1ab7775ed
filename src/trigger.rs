use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TAG_PATTERN: &str = r"^v\d+(\.\d+){0,2}$";

static DEFAULT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(DEFAULT_TAG_PATTERN).expect("default tag pattern is a valid regex")
});

/// Decides which pushed refs are release tags.
#[derive(Debug, Clone)]
pub struct TagPattern {
    regex: Regex,
}

impl Default for TagPattern {
    fn default() -> Self {
        Self {
            regex: DEFAULT_PATTERN.clone(),
        }
    }
}

impl TagPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex =
            Regex::new(pattern).with_context(|| format!("Invalid tag pattern: {pattern}"))?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.regex.is_match(tag)
    }
}

/// The push that started a run. Only constructed for refs that match the tag pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tag: String,
    pub revision: Option<String>,
    pub actor: Option<String>,
}

impl TriggerEvent {
    /// Accepts a bare tag (`v1.2.3`) or a full ref (`refs/tags/v1.2.3`).
    /// Returns `None` for branch refs and tags the pattern rejects.
    pub fn from_push(
        git_ref: &str,
        revision: Option<String>,
        actor: Option<String>,
        pattern: &TagPattern,
    ) -> Option<Self> {
        let tag = tag_from_ref(git_ref)?;
        if !pattern.matches(tag) {
            return None;
        }
        Some(Self {
            tag: tag.to_string(),
            revision: revision.filter(|r| !r.trim().is_empty()),
            actor: actor.filter(|a| !a.trim().is_empty()),
        })
    }
}

fn tag_from_ref(git_ref: &str) -> Option<&str> {
    let trimmed = git_ref.trim();
    if let Some(tag) = trimmed.strip_prefix("refs/tags/") {
        return (!tag.is_empty()).then_some(tag);
    }
    if trimmed.starts_with("refs/") || trimmed.is_empty() {
        return None;
    }
    Some(trimmed)
}
