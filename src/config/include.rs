use anyhow::Context;
use serde::Deserialize;

use crate::config::{Config, ConfigError};
use crate::scm::ScmProvider;

/// Configuration files to import from another project.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Include {
    #[serde(default)]
    pub project: String,
    /// Paths relative to the repository root.
    #[serde(default)]
    pub files: Vec<String>,
    /// Branch, tag or commit to read from. The default branch is used when missing.
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

impl Include {
    fn validate(&self, position: usize) -> Result<(), ConfigError> {
        if self.project.is_empty() {
            return Err(ConfigError::Include(format!(
                "entry #{position} is missing the required 'project' field"
            )));
        }
        if self.files.is_empty() {
            return Err(ConfigError::Include(format!(
                "entry #{position} (project {}) does not list any 'files'",
                self.project
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Fetches every included file and appends its actions and labels to this configuration.
    pub async fn load_includes(&mut self, provider: &dyn ScmProvider) -> anyhow::Result<()> {
        let includes = std::mem::take(&mut self.includes);
        for (index, include) in includes.iter().enumerate() {
            include.validate(index + 1)?;
            tracing::debug!(
                "Loading remote configuration from project {}",
                include.project
            );

            let mut files = provider
                .get_project_files(&include.project, include.git_ref.as_deref(), &include.files)
                .await
                .with_context(|| {
                    format!(
                        "failed to load included config files from project [{}]",
                        include.project
                    )
                })?;

            for file in &include.files {
                let content = files.remove(file).ok_or_else(|| {
                    ConfigError::Include(format!(
                        "file [{file}] was not found in project [{}]",
                        include.project
                    ))
                })?;
                if content.trim().is_empty() {
                    return Err(ConfigError::Include(format!(
                        "file [{file}] from project [{}] is empty",
                        include.project
                    ))
                    .into());
                }

                let remote = Config::parse(&content).with_context(|| {
                    format!(
                        "failed to parse remote config file [{file}] from project [{}]",
                        include.project
                    )
                })?;
                self.merge_included(remote, file, &include.project);
            }
        }
        self.includes = includes;

        Ok(())
    }

    fn merge_included(&mut self, remote: Config, file: &str, project: &str) {
        if !remote.includes.is_empty() {
            tracing::warn!(
                "file [{file}] from project [{project}] may not have any 'include' settings; recursive include is not supported"
            );
        }
        if remote.dry_run.is_some() {
            tracing::warn!(
                "file [{file}] from project [{project}] may not have a 'dry_run' setting; remote includes are not allowed to change this setting"
            );
        }
        tracing::debug!(
            "file [{file}] from project [{project}] added {} actions and {} labels",
            remote.actions.len(),
            remote.labels.len()
        );
        self.actions.extend(remote.actions);
        self.labels.extend(remote.labels);
    }
}
