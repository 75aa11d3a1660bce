//! External ownership catalogs used to find reviewers for a project.
use anyhow::Context;
use axum::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::scm::{Actor, Project};

/// Resolves the people owning a project.
#[async_trait]
pub trait OwnerCatalog: Send + Sync {
    /// Returns the owners of `project`, never including `author`.
    async fn owners(&self, project: &Project, author: &Actor) -> anyhow::Result<Vec<Actor>>;
}

const USER_ID_ANNOTATION: &str = "gitlab.com/user_id";

#[derive(Debug, Default, Deserialize)]
struct Entity {
    #[serde(default)]
    metadata: EntityMetadata,
    #[serde(default)]
    spec: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct EntityMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    annotations: std::collections::HashMap<String, String>,
}

/// Backstage software catalog. The owning group of the project's `system` entity provides the
/// reviewers, identified by their GitLab user id annotation.
pub struct BackstageCatalog {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl BackstageCatalog {
    pub fn new(base_url: &str, token: Option<SecretString>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Cannot build Backstage HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn list_entities(
        &self,
        filters: &[String],
        fields: &[&str],
    ) -> anyhow::Result<Vec<Entity>> {
        let mut query: Vec<(&str, String)> = filters
            .iter()
            .map(|filter| ("filter", filter.clone()))
            .collect();
        query.push(("fields", fields.join(",")));

        let mut request = self
            .client
            .get(format!("{}/api/catalog/entities", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Backstage catalog answered {status}: {text}");
        }
        Ok(response.json::<Vec<Entity>>().await?)
    }
}

#[async_trait]
impl OwnerCatalog for BackstageCatalog {
    async fn owners(&self, project: &Project, author: &Actor) -> anyhow::Result<Vec<Actor>> {
        let slug = project.full_path.as_str();
        if slug.is_empty() {
            tracing::debug!("Empty project path, cannot look up owners");
            return Ok(vec![]);
        }
        let name = slug.rsplit('/').next().unwrap_or(slug);

        let systems = self
            .list_entities(
                &[
                    format!("kind=system,metadata.name={name}"),
                    format!("kind=system,metadata.annotations.gitlab.com/project-slug={slug}"),
                    format!("kind=system,metadata.annotations.gitlab.com/project={name}"),
                ],
                &["spec.owner", "metadata.name"],
            )
            .await
            .context("Failed to search Backstage catalog")?;

        let Some(system) = systems.first() else {
            tracing::debug!("No systems found in Backstage catalog");
            return Ok(vec![]);
        };
        let owner = match system.spec.get("owner") {
            None => {
                tracing::debug!(
                    "No owner found in Backstage catalog for system {}",
                    system.metadata.name
                );
                return Ok(vec![]);
            }
            Some(serde_json::Value::String(owner)) => owner.clone(),
            Some(other) => anyhow::bail!("owner field is not a string: {other}"),
        };

        let users = self
            .list_entities(
                &[format!("kind=user,relations.memberof={owner}")],
                &[&format!("metadata.annotations.{USER_ID_ANNOTATION}")],
            )
            .await
            .context("Failed to search Backstage catalog for users")?;
        if users.is_empty() {
            tracing::debug!("No users found in Backstage catalog for group {owner}");
        }

        let author_id = author.numeric_id();
        Ok(users
            .into_iter()
            .filter_map(|user| user.metadata.annotations.get(USER_ID_ANNOTATION).cloned())
            .map(|id| Actor {
                id,
                ..Default::default()
            })
            .filter(|actor| actor.id != author.id && actor.numeric_id() != author_id)
            .collect())
    }
}
