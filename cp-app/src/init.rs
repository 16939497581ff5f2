//! Scaffolding for `chatpace init`.
//!
//! Creates `~/.chatpace/` from the bundled templates without overwriting
//! existing local files.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[
    TemplateFile {
        relative_path: "config.toml",
        contents: include_str!("../../config-templates/config.toml"),
    },
    TemplateFile {
        relative_path: "prompts/prompt.md",
        contents: include_str!("../../config-templates/prompts/prompt.md"),
    },
];

/// Directories the runtime expects even when empty.
const RUNTIME_DIRS: &[&str] = &["stickers", "data"];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path();
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        skipped: Vec::new(),
    };

    for dir in RUNTIME_DIRS {
        let dir = root.join(dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow::anyhow!("create runtime dir {}: {e}", dir.display()))?;
    }

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(_) => report.skipped.push(target),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        anyhow::anyhow!("create config dir {}: {e}", parent.display())
                    })?;
                }
                tokio::fs::write(&target, template.contents)
                    .await
                    .map_err(|e| anyhow::anyhow!("write template {}: {e}", target.display()))?;
                tracing::debug!(path = %target.display(), "template written");
                report.created.push(target);
            }
            Err(err) => {
                return Err(anyhow::anyhow!("inspect path {}: {err}", target.display()));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{RUNTIME_DIRS, TEMPLATE_FILES, initialize_at_root};

    #[tokio::test]
    async fn init_creates_templates_and_runtime_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join(".chatpace");
        let report = initialize_at_root(&root).await.expect("init succeeds");

        assert_eq!(report.created.len(), TEMPLATE_FILES.len());
        assert!(report.skipped.is_empty());
        for template in TEMPLATE_FILES {
            let target = root.join(template.relative_path);
            assert!(target.exists(), "missing template {}", target.display());
        }
        for dir in RUNTIME_DIRS {
            assert!(root.join(dir).is_dir(), "missing dir {dir}");
        }
    }

    #[tokio::test]
    async fn init_never_overwrites_local_edits() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        initialize_at_root(&root).await.expect("first init succeeds");
        std::fs::write(root.join("config.toml"), "[general]\nbot_name = \"mine\"\n")
            .expect("edit config");

        let second = initialize_at_root(&root).await.expect("second init succeeds");
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), TEMPLATE_FILES.len());
        let contents = std::fs::read_to_string(root.join("config.toml")).expect("read config");
        assert!(contents.contains("mine"));
    }
}
