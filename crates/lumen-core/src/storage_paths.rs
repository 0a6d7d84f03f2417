use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_DIR_ENV: &str = "LUMEN_STATE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LumenPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub project_config_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl LumenPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_dir: root.join("data"),
            project_config_path: root.join("config.json"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Creates the state and log directories.
    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.state_dir, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(())
    }
}

/// Resolves the lumen root: an explicit override, then `LUMEN_STATE_DIR`, then
/// the platform data dir.
pub fn resolve_lumen_paths(override_root: Option<&Path>) -> anyhow::Result<LumenPaths> {
    resolve_lumen_paths_from(override_root, |key| std::env::var(key).ok())
}

fn resolve_lumen_paths_from(
    override_root: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<LumenPaths> {
    if let Some(root) = override_root {
        return Ok(LumenPaths::from_root(root));
    }
    if let Some(root) = lookup(STATE_DIR_ENV).filter(|v| !v.trim().is_empty()) {
        return Ok(LumenPaths::from_root(root.trim()));
    }
    let base = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to resolve data dir"))?;
    Ok(LumenPaths::from_root(base.join("lumen")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_the_root() {
        let paths = LumenPaths::from_root("/tmp/lumen-test");
        assert_eq!(paths.state_dir, PathBuf::from("/tmp/lumen-test/data"));
        assert_eq!(paths.logs_dir, PathBuf::from("/tmp/lumen-test/logs"));
        assert_eq!(
            paths.project_config_path,
            PathBuf::from("/tmp/lumen-test/config.json")
        );
    }

    #[test]
    fn override_wins_over_environment() {
        let explicit = PathBuf::from("/srv/lumen");
        let paths = resolve_lumen_paths_from(Some(&explicit), |_| Some("/env/lumen".to_string()))
            .expect("paths");
        assert_eq!(paths.root, explicit);

        let from_env =
            resolve_lumen_paths_from(None, |_| Some(" /env/lumen ".to_string())).expect("paths");
        assert_eq!(from_env.root, PathBuf::from("/env/lumen"));
    }

    #[test]
    fn ensure_creates_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = LumenPaths::from_root(dir.path().join("lumen"));
        paths.ensure().expect("ensure");
        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
    }
}
