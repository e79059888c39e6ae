//! Definition store provisioning: the user roles and definition files
//! a test run depends on, loaded before any scenario is played.

use crate::identity::IdentityProvider;
use crate::model::UserData;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use url::Url;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// A role to create, with its security classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    pub role: String,
    pub security_classification: String,
}

impl RoleConfig {
    pub fn new(role: impl Into<String>, security_classification: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            security_classification: security_classification.into(),
        }
    }
}

/// Contents of a provisioning file.
///
/// ```yaml
/// definitionStoreUrl: http://localhost:4451
/// importer:
///   username: importer@example.com
/// definitionsDir: definitions/valid
/// roles:
///   - role: caseworker-autotest1
///     securityClassification: PUBLIC
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionConfig {
    pub definition_store_url: String,
    /// User every provisioning call is made as.
    pub importer: UserData,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
}

impl ProvisionConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read provisioning file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse provisioning file: {}", path.display()))
    }
}

/// Outcome of a provisioning step. A failed item is logged and
/// skipped; the remaining items are still attempted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ProvisionReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, item: String, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                info!("Provisioned {}", item);
                self.succeeded.push(item);
            }
            Err(err) => {
                error!("Couldn't provision {}: {:#}", item, err);
                self.failed.push((item, format!("{err:#}")));
            }
        }
    }
}

/// Adds roles and imports definition files into a definition store.
pub struct DefinitionStoreLoader {
    client: Client,
    base_url: String,
    timeout: Duration,
    identity: Arc<dyn IdentityProvider>,
    importer: UserData,
}

impl DefinitionStoreLoader {
    pub fn new(
        config: &ProvisionConfig,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: config.definition_store_url.clone(),
            timeout,
            identity,
            importer: config.importer.clone(),
        }
    }

    /// Create every role in `roles`.
    #[instrument(skip(self, roles), fields(store = %self.base_url))]
    pub async fn add_roles(&self, roles: &[RoleConfig]) -> ProvisionReport {
        info!("{} roles will be added to '{}'", roles.len(), self.base_url);
        let mut report = ProvisionReport::default();
        for role in roles {
            let outcome = self.add_role(role).await;
            report.record(
                format!("role {} ({})", role.role, role.security_classification),
                outcome,
            );
        }
        report
    }

    /// Import every definition file found under `dir`.
    #[instrument(skip(self, dir), fields(store = %self.base_url))]
    pub async fn import_definitions(&self, dir: &Path) -> Result<ProvisionReport> {
        let files = definition_files(dir)?;
        info!(
            "{} definition files will be uploaded to '{}'",
            files.len(),
            self.base_url
        );
        let mut report = ProvisionReport::default();
        for file in files {
            let outcome = self.import_definition(&file).await;
            report.record(format!("definition {}", file.display()), outcome);
        }
        Ok(report)
    }

    async fn add_role(&self, role: &RoleConfig) -> Result<()> {
        let token = self.importer_token().await?;
        let response = self
            .client
            .put(self.endpoint("api/user-role")?)
            .timeout(self.timeout)
            .bearer_auth(token)
            .json(&json!({
                "role": role.role,
                "security_classification": role.security_classification,
            }))
            .send()
            .await
            .context("Failed to send role request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Adding role failed with status {status}: {body}");
        }
        Ok(())
    }

    async fn import_definition(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read(path)
            .await
            .context(format!("Failed to read definition file: {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("definition.xlsx")
            .to_string();
        let part = Part::bytes(content).file_name(file_name).mime_str(XLSX_MIME)?;

        let token = self.importer_token().await?;
        let response = self
            .client
            .post(self.endpoint("import")?)
            .timeout(self.timeout)
            .bearer_auth(token)
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .context("Failed to send import request")?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            bail!("Import failed with status {status}: {body}");
        }
        Ok(())
    }

    async fn importer_token(&self) -> Result<String> {
        let identity = self
            .identity
            .authenticate(&self.importer)
            .await
            .context("Failed to authenticate importer")?;
        identity
            .access_token
            .ok_or_else(|| anyhow!("Importer '{}' has no access token", self.importer.username))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .context(format!("Invalid definition store URL: {}", self.base_url))
    }
}

/// Definition workbooks under `dir`, recursively and sorted. Office
/// lock files (`~$...`) are skipped.
pub fn definition_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_definition_files(dir, &mut files)?;
    files.sort();
    debug!("Found {} definition files in {}", files.len(), dir.display());
    Ok(files)
}

fn collect_definition_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .context(format!("Failed to read definitions directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_definition_files(&path, files)?;
        } else if is_definition_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_definition_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| {
            !name.starts_with("~$") && name.to_ascii_lowercase().ends_with(".xlsx")
        })
}
