use crate::model::LmModel;
use crate::platform::on_path;
use async_trait::async_trait;
use reqwest::{Client, Method, Request, StatusCode, Url};
use serde::Deserialize;
use std::{fmt, process::Stdio, time::Duration};
use tokio::process::Command;

const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_API_URL: &str = "http://localhost:1234";
pub const DEFAULT_CLI: &str = "lms";

/// The local model server surface used by the router and publishers.
#[async_trait]
pub trait ModelServer: Send + Sync {
    /// Any failure to reach the API counts as "not running".
    async fn is_running(&self) -> bool;
    async fn list_models(&self) -> Result<Vec<LmModel>, ModelServerError>;
    async fn start_server(&self) -> Result<(), ModelServerError>;
    async fn stop_server(&self) -> Result<(), ModelServerError>;
    async fn load_model(&self, model_id: &str) -> Result<(), ModelServerError>;
    /// `None` unloads every model.
    async fn unload_model(&self, model_id: Option<&str>) -> Result<(), ModelServerError>;
}

#[derive(Clone, Debug)]
pub struct LmStudioClient {
    http: Client,
    base_url: Url,
    cli: String,
}

#[derive(Clone, Debug)]
pub struct LmStudioClientBuilder {
    base_url: String,
    cli: String,
    timeout: Duration,
}

impl LmStudioClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            cli: DEFAULT_CLI.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<LmStudioClient, ModelServerError> {
        LmStudioClient::from_parts(self.base_url, self.cli, self.timeout)
    }
}

impl LmStudioClient {
    pub fn builder(base_url: impl Into<String>) -> LmStudioClientBuilder {
        LmStudioClientBuilder::new(base_url)
    }

    fn from_parts(
        base_url: String,
        cli: String,
        timeout: Duration,
    ) -> Result<Self, ModelServerError> {
        if base_url.trim().is_empty() {
            return Err(ModelServerError::Config("LM Studio API URL must not be empty"));
        }
        if cli.trim().is_empty() {
            return Err(ModelServerError::Config("LM Studio CLI name must not be empty"));
        }

        let mut parsed =
            Url::parse(base_url.trim()).map_err(|err| ModelServerError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ModelServerError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            cli,
        })
    }

    pub fn cli_available(&self) -> bool {
        on_path(&self.cli)
    }

    pub fn build_models_request(&self) -> Result<Request, ModelServerError> {
        let url = self
            .base_url
            .join("api/v0/models")
            .map_err(|err| ModelServerError::Url(err.to_string()))?;
        self.http
            .request(Method::GET, url)
            .build()
            .map_err(ModelServerError::Http)
    }

    async fn fetch_models(&self) -> Result<(StatusCode, String), ModelServerError> {
        let req = self.build_models_request()?;
        let resp = self.http.execute(req).await.map_err(ModelServerError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ModelServerError::Http)?;
        Ok((status, body))
    }

    async fn run_cli(&self, args: &[&str]) -> Result<String, ModelServerError> {
        let command = format!("{} {}", self.cli, args.join(" "));
        if !self.cli_available() {
            return Err(ModelServerError::CliUnavailable(self.cli.clone()));
        }
        tracing::info!("Running {}", command);
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ModelServerError::Cli {
                command: command.clone(),
                detail: err.to_string(),
            })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();
        if !output.status.success() {
            return Err(ModelServerError::Cli {
                command,
                detail: format!("{}, output: {}", output.status, combined),
            });
        }
        tracing::debug!("{} output: {}", command, combined);
        Ok(combined)
    }
}

#[async_trait]
impl ModelServer for LmStudioClient {
    async fn is_running(&self) -> bool {
        match self.fetch_models().await {
            Ok((status, _)) => status == StatusCode::OK,
            Err(err) => {
                tracing::debug!("LM Studio server not reachable: {}", err);
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<LmModel>, ModelServerError> {
        let (status, body) = self.fetch_models().await?;
        parse_models_response(status, &body)
    }

    async fn start_server(&self) -> Result<(), ModelServerError> {
        self.run_cli(&["server", "start"]).await.map(|_| ())
    }

    async fn stop_server(&self) -> Result<(), ModelServerError> {
        self.run_cli(&["server", "stop"]).await.map(|_| ())
    }

    async fn load_model(&self, model_id: &str) -> Result<(), ModelServerError> {
        self.run_cli(&["load", model_id]).await.map(|_| ())
    }

    async fn unload_model(&self, model_id: Option<&str>) -> Result<(), ModelServerError> {
        match model_id {
            Some(id) => self.run_cli(&["unload", id]).await.map(|_| ()),
            None => self.run_cli(&["unload", "--all"]).await.map(|_| ()),
        }
    }
}

#[derive(Debug)]
pub enum ModelServerError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    Api { status: StatusCode, body: String },
    CliUnavailable(String),
    Cli { command: String, detail: String },
}

impl fmt::Display for ModelServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
            Self::CliUnavailable(cli) => write!(f, "{cli} CLI is not installed or not accessible"),
            Self::Cli { command, detail } => write!(f, "`{command}` failed: {detail}"),
        }
    }
}

impl std::error::Error for ModelServerError {}

#[derive(Debug, Deserialize)]
struct ModelsEnvelope {
    #[serde(default)]
    data: Vec<LmModel>,
}

pub fn parse_models_response(
    status: StatusCode,
    body: &str,
) -> Result<Vec<LmModel>, ModelServerError> {
    if status != StatusCode::OK {
        return Err(ModelServerError::Api {
            status,
            body: body.to_string(),
        });
    }
    let envelope: ModelsEnvelope = serde_json::from_str(body).map_err(ModelServerError::Json)?;
    Ok(envelope.data)
}

/// One `id (type, state)` line per model.
pub fn format_model_list(models: &[LmModel]) -> String {
    if models.is_empty() {
        return "No models".to_string();
    }
    models
        .iter()
        .map(|m| format!("{} ({}, {})", m.id, m.model_type, m.state))
        .collect::<Vec<_>>()
        .join("\n")
}
