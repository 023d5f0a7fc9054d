//! Prompt-selected skills.
//!
//! A skill is a directory holding a `SKILL.md` file: YAML frontmatter
//! (`name`, `description`, `triggers`, `services`) between `---` lines,
//! followed by markdown guidance injected into the system prompt when the
//! skill is selected. Services listed under `services` are only offered to
//! the model while the skill is active.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Lowercase phrases; an empty list means the name and description
    /// words are matched instead.
    pub triggers: Vec<String>,
    pub services: Vec<String>,
    pub content: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
    triggers: Option<Triggers>,
    #[serde(default)]
    services: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Triggers {
    List(Vec<String>),
    /// `triggers: "a, b, c"`
    Csv(String),
}

impl Triggers {
    fn into_vec(self) -> Vec<String> {
        let raw = match self {
            Self::List(items) => items,
            Self::Csv(text) => text.split(',').map(str::to_string).collect(),
        };
        raw.into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Split a `SKILL.md` into frontmatter YAML and body.
fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("---") else {
        return (None, text);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, text);
    };
    if let Some(end) = rest.find("\n---") {
        let yaml = &rest[..end];
        let body = rest[end + 4..].trim_start_matches(['-', '\r']).trim();
        (Some(yaml), body)
    } else {
        (Some(rest), "")
    }
}

impl Skill {
    /// Parse a skill from `SKILL.md` text. `dir_name` is the fallback name.
    pub fn parse(dir_name: &str, text: &str, path: PathBuf) -> Self {
        let (yaml, body) = split_frontmatter(text);
        let meta = match yaml.map(serde_yaml::from_str::<Frontmatter>) {
            Some(Ok(meta)) => meta,
            Some(Err(e)) => {
                warn!(skill = %dir_name, error = %e, "Skill frontmatter is not valid YAML");
                Frontmatter::default()
            }
            None => Frontmatter::default(),
        };

        Self {
            name: meta
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| dir_name.to_string()),
            description: meta.description.unwrap_or_default(),
            triggers: meta.triggers.map(Triggers::into_vec).unwrap_or_default(),
            services: meta.services,
            content: body.to_string(),
            path,
        }
    }

    fn load(dir: &Path) -> Option<Self> {
        let file = dir.join(SKILL_FILE);
        if !file.is_file() {
            return None;
        }
        let text = match std::fs::read_to_string(&file) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Failed to read skill");
                return None;
            }
        };
        let dir_name = dir.file_name()?.to_string_lossy().into_owned();
        Some(Self::parse(&dir_name, &text, dir.to_path_buf()))
    }

    /// Whether the (lowercased) prompt activates this skill.
    pub fn matches(&self, prompt_lower: &str) -> bool {
        if !self.triggers.is_empty() {
            return self.triggers.iter().any(|t| prompt_lower.contains(t.as_str()));
        }
        let name = self.name.replace('-', " ").to_lowercase();
        let description = self.description.to_lowercase();
        description
            .split_whitespace()
            .chain(name.split_whitespace())
            .map(|w| w.trim_matches(|c: char| matches!(c, '.' | ',' | ':' | '，' | '。' | '：')))
            .any(|w| w.chars().count() >= 2 && prompt_lower.contains(w))
    }
}

/// Every skill found under the configured directories.
#[derive(Debug, Clone, Default)]
pub struct SkillCatalog {
    skills: Vec<Skill>,
}

impl SkillCatalog {
    pub fn new(skills: Vec<Skill>) -> Self {
        let mut catalog = Self::default();
        for skill in skills {
            catalog.insert(skill);
        }
        catalog
    }

    /// Scan `paths` in order; a skill found later replaces an earlier one
    /// with the same name. Missing directories are skipped.
    pub fn discover(paths: &[PathBuf]) -> Self {
        let mut catalog = Self::default();
        for root in paths {
            let Ok(entries) = std::fs::read_dir(root) else {
                debug!(path = %root.display(), "Skills directory not found, skipping");
                continue;
            };
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();
            for dir in dirs {
                if let Some(skill) = Skill::load(&dir) {
                    catalog.insert(skill);
                }
            }
        }
        debug!(count = catalog.len(), "Skills discovered");
        catalog
    }

    fn insert(&mut self, skill: Skill) {
        match self.skills.iter_mut().find(|s| s.name == skill.name) {
            Some(existing) => *existing = skill,
            None => self.skills.push(skill),
        }
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn all(&self) -> &[Skill] {
        &self.skills
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name)
    }

    /// Skills whose triggers match `prompt`.
    pub fn select(&self, prompt: &str) -> Vec<&Skill> {
        let text = prompt.trim().to_lowercase();
        if text.is_empty() {
            return Vec::new();
        }
        self.skills.iter().filter(|s| s.matches(&text)).collect()
    }

    /// Explicit selection by name; unknown names are ignored.
    pub fn select_named(&self, names: &[String]) -> Vec<&Skill> {
        self.skills.iter().filter(|s| names.contains(&s.name)).collect()
    }

    /// Services gated behind some skill.
    pub fn claimed_services(&self) -> BTreeSet<&str> {
        self.skills
            .iter()
            .flat_map(|s| s.services.iter().map(String::as_str))
            .collect()
    }
}

/// Render the selected skills as a system-prompt section.
pub fn context_for(skills: &[&Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let mut parts = vec![
        "## Agent Skills".to_string(),
        "Apply the following skills where relevant and follow their instructions:".to_string(),
        String::new(),
    ];
    for skill in skills {
        parts.push(format!("### {}", skill.name));
        if !skill.description.is_empty() {
            parts.push(format!("**Description**: {}", skill.description));
        }
        parts.push(String::new());
        parts.push(skill.content.trim().to_string());
        parts.push(String::new());
    }
    parts.join("\n")
}
