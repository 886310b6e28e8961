//! Project registry: trigger words and short names for project directories.
//!
//! A trigger word is a whole message ("todo", "切换到 todo") that switches the
//! sender's active project. Short names are what `--project` may use instead
//! of a full path.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Prefixes accepted in front of a trigger word.
const SWITCH_PREFIXES: &[&str] = &["切换到", "switch to"];

/// One entry of `project_trigger_mapping`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTriggers {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// A resolved trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub trigger: String,
    pub project_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    /// Project name -> triggers, sorted by name for stable listings.
    projects: BTreeMap<String, ProjectTriggers>,
    triggers: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

impl ProjectRegistry {
    pub fn new(
        projects: BTreeMap<String, ProjectTriggers>,
        aliases: HashMap<String, String>,
    ) -> Self {
        let mut triggers = HashMap::new();
        for info in projects.values() {
            for trigger in &info.triggers {
                let trigger = trigger.trim();
                if !trigger.is_empty() {
                    triggers.insert(trigger.to_string(), info.path.clone());
                }
            }
        }
        Self {
            projects,
            triggers,
            aliases,
        }
    }

    /// True when no trigger words are configured.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    /// Short project names usable with `--project`.
    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    /// Match a whole message against the trigger words.
    pub fn match_trigger(&self, message: &str) -> Option<TriggerMatch> {
        let mut candidate = message.trim();
        for prefix in SWITCH_PREFIXES {
            if let Some(rest) = strip_prefix_ignore_case(candidate, prefix) {
                candidate = rest.trim();
                break;
            }
        }

        self.triggers.get(candidate).map(|path| TriggerMatch {
            trigger: candidate.to_string(),
            project_path: path.clone(),
        })
    }

    /// One `- t1、t2 -> path` line per project.
    pub fn display_list(&self) -> String {
        self.projects
            .values()
            .map(|info| format!("- {} -> {}", info.triggers.join("、"), info.path))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}
