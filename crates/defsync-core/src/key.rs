use crate::DefinitionKind;

pub const AGENTS_DIR: &str = "agents";
pub const COMMANDS_DIR: &str = "commands";
pub const SKILLS_DIR: &str = "skills";
pub const SKILL_PRIMARY_FILE: &str = "SKILL.md";

const DEFINITION_EXTENSION: &str = ".md";

/// Maps remote paths to canonical definition keys for one source layout.
///
/// Recognized conventions, relative to the source root:
/// - `agents/<path>.md` and `commands/<path>.md` are single-file definitions;
/// - `skills/<name>/SKILL.md` is the primary file of a directory-based definition.
///
/// Sub-files of a skill directory resolve to `None`: they belong to a key
/// without being keys themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyResolver {
    root: String,
}

impl KeyResolver {
    pub fn new(root: &str) -> Self {
        let trimmed = root.trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> Option<String> {
        let relative = path.strip_prefix(self.root.as_str())?;
        let (dir, rest) = relative.split_once('/')?;
        match dir {
            AGENTS_DIR | COMMANDS_DIR => {
                let stem = rest.strip_suffix(DEFINITION_EXTENSION)?;
                if stem.is_empty() || stem.split('/').any(str::is_empty) {
                    return None;
                }
                Some(format!("{dir}/{stem}"))
            }
            SKILLS_DIR => {
                let (name, file) = rest.split_once('/')?;
                (!name.is_empty() && file == SKILL_PRIMARY_FILE).then(|| format!("{dir}/{name}"))
            }
            _ => None,
        }
    }

    /// Path recorded as `upstreamPath`: the file for single-file kinds, the
    /// directory for directory-based kinds.
    pub fn upstream_path(&self, key: &str) -> Option<String> {
        let kind = DefinitionKind::from_key(key)?;
        if kind.is_directory_based() {
            Some(format!("{}{key}", self.root))
        } else {
            Some(format!("{}{key}{DEFINITION_EXTENSION}", self.root))
        }
    }

    /// Directory prefix (with trailing slash) owning every member of a directory-based key.
    pub fn directory_prefix(&self, key: &str) -> Option<String> {
        DefinitionKind::from_key(key)
            .filter(|kind| kind.is_directory_based())
            .map(|_| format!("{}{key}/", self.root))
    }
}
