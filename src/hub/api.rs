//! Typed hub requests over a [`BleClient`].

use std::fmt;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::events::HubEvent;
use super::types::AppRequestType;
use crate::client::{BleClient, ClientError, EventFilter, ListenerId, ListenerResult};
use crate::link::GattConnector;

/// Hub API errors.
#[derive(Debug)]
pub enum HubError {
    /// Transport failure.
    Client(ClientError),
    /// The request body could not be encoded or the response not decoded.
    Json(serde_json::Error),
    /// The hub answered with `result: false`.
    Failed {
        request: AppRequestType,
        reason: Option<String>,
    },
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(e) => write!(f, "{}", e),
            Self::Json(e) => write!(f, "invalid JSON: {}", e),
            Self::Failed {
                request,
                reason: Some(reason),
            } => write!(f, "{} failed: {}", request, reason),
            Self::Failed {
                request,
                reason: None,
            } => write!(f, "{} failed", request),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Client(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Failed { .. } => None,
        }
    }
}

impl From<ClientError> for HubError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// A project stored on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
}

/// Outcome of a Lua syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxCheckResult {
    pub success: bool,
    /// Parse time reported by the hub, in milliseconds.
    pub parse_time: i64,
    pub error_message: String,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyntaxReport {
    #[serde(default)]
    parse_time: i64,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
struct Autostart {
    project: Option<String>,
}

#[derive(Serialize)]
struct ProjectFile<'a> {
    project: &'a str,
    filename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

/// MegaHub application API.
///
/// Every request body is JSON; the hub ignores requests it cannot parse, so
/// operations without arguments send `{}`.
pub struct HubClient<C: GattConnector> {
    client: BleClient<C>,
}

impl<C: GattConnector> HubClient<C> {
    pub fn new(client: BleClient<C>) -> Self {
        Self { client }
    }

    /// The underlying transport client.
    pub fn client(&self) -> &BleClient<C> {
        &self.client
    }

    /// Connect and tell the hub to start publishing events.
    pub async fn connect(&self) -> Result<(), HubError> {
        self.client.connect().await?;
        self.ready_for_events().await
    }

    pub async fn get_projects(&self) -> Result<Vec<ProjectEntry>, HubError> {
        let response = self.call(AppRequestType::GetProjects, &json!({})).await?;
        let list: ProjectList = self.expect_ok(AppRequestType::GetProjects, &response)?;
        Ok(list.projects)
    }

    /// Fetch a project file. The hub answers with the raw file contents.
    pub async fn get_project_file(
        &self,
        project: &str,
        filename: &str,
    ) -> Result<Vec<u8>, HubError> {
        let body = ProjectFile {
            project,
            filename,
            content: None,
        };
        self.call(AppRequestType::GetProjectFile, &body).await
    }

    pub async fn put_project_file(
        &self,
        project: &str,
        filename: &str,
        content: &str,
    ) -> Result<(), HubError> {
        let body = ProjectFile {
            project,
            filename,
            content: Some(content),
        };
        self.simple(AppRequestType::PutProjectFile, &body).await
    }

    pub async fn delete_project(&self, project: &str) -> Result<(), HubError> {
        self.simple(AppRequestType::DeleteProject, &json!({ "project": project }))
            .await
    }

    /// Check a Lua script. A syntax error is reported in the result, not as
    /// an error.
    pub async fn syntax_check(&self, lua: &str) -> Result<SyntaxCheckResult, HubError> {
        let response = self
            .call(AppRequestType::SyntaxCheck, &json!({ "luaScript": lua }))
            .await?;
        let status: Status = serde_json::from_slice(&response)?;
        if let Some(reason) = status.error {
            return Err(HubError::Failed {
                request: AppRequestType::SyntaxCheck,
                reason: Some(reason),
            });
        }
        let report: SyntaxReport = serde_json::from_slice(&response)?;
        Ok(SyntaxCheckResult {
            success: status.result,
            parse_time: report.parse_time,
            error_message: report.error_message,
        })
    }

    pub async fn run_program(&self, lua: &str) -> Result<(), HubError> {
        self.simple(AppRequestType::RunProgram, &json!({ "luaScript": lua }))
            .await
    }

    pub async fn stop_program(&self) -> Result<(), HubError> {
        self.simple(AppRequestType::StopProgram, &json!({})).await
    }

    /// The autostart project, or `None` when none is set.
    pub async fn get_autostart(&self) -> Result<Option<String>, HubError> {
        let response = self.call(AppRequestType::GetAutostart, &json!({})).await?;
        let status: Status = serde_json::from_slice(&response)?;
        if let Some(reason) = status.error {
            return Err(HubError::Failed {
                request: AppRequestType::GetAutostart,
                reason: Some(reason),
            });
        }
        if !status.result {
            return Ok(None);
        }
        let autostart: Autostart = serde_json::from_slice(&response)?;
        Ok(autostart.project.filter(|p| !p.is_empty()))
    }

    pub async fn put_autostart(&self, project: &str) -> Result<(), HubError> {
        self.simple(AppRequestType::PutAutostart, &json!({ "project": project }))
            .await
    }

    /// Enable event publishing on the hub for this connection.
    pub async fn ready_for_events(&self) -> Result<(), HubError> {
        self.simple(AppRequestType::ReadyForEvents, &json!({})).await
    }

    pub async fn request_pairing(&self, mac: &str) -> Result<(), HubError> {
        self.simple(AppRequestType::RequestPairing, &json!({ "mac": mac }))
            .await
    }

    pub async fn remove_pairing(&self, mac: &str) -> Result<(), HubError> {
        self.simple(AppRequestType::RemovePairing, &json!({ "mac": mac }))
            .await
    }

    /// Start Bluetooth Classic discovery. Fails if one is already running.
    pub async fn start_discovery(&self) -> Result<(), HubError> {
        self.simple(AppRequestType::StartDiscovery, &json!({})).await
    }

    /// Register a listener for every hub event, decoded.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(HubEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.client
            .add_event_listener(EventFilter::Any, move |event| {
                listener(HubEvent::decode(event))
            })
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        request: AppRequestType,
        body: &B,
    ) -> Result<Vec<u8>, HubError> {
        let body = serde_json::to_vec(body)?;
        debug!("{} request, {} byte body", request, body.len());
        Ok(self.client.request(request.as_u8(), &body).await?)
    }

    async fn simple<B: Serialize + ?Sized>(
        &self,
        request: AppRequestType,
        body: &B,
    ) -> Result<(), HubError> {
        let response = self.call(request, body).await?;
        self.expect_ok::<serde::de::IgnoredAny>(request, &response)?;
        Ok(())
    }

    /// Decode a JSON response, failing on `result: false`.
    fn expect_ok<T: DeserializeOwned>(
        &self,
        request: AppRequestType,
        response: &[u8],
    ) -> Result<T, HubError> {
        let status: Status = serde_json::from_slice(response)?;
        if !status.result {
            warn!(
                "{} rejected by hub: {}",
                request,
                status.error.as_deref().unwrap_or("no reason given")
            );
            return Err(HubError::Failed {
                request,
                reason: status.error,
            });
        }
        Ok(serde_json::from_slice(response)?)
    }
}
