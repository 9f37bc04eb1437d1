//! Update protocol client - asks an Omaha-style server whether a tracked
//! application has a newer version.
//!
//! A check never fails loudly: every problem is folded into `CheckOutcome` and
//! logged, because update checks must not disturb the managed application.

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use unattended_common::omaha::{STATUS_NO_UPDATE, STATUS_OK};
use unattended_common::{OmahaManifest, OmahaRequest, OmahaResponse, UpdateManifest};

/// Reported when the installed version cannot be determined
pub const UNKNOWN_VERSION: &str = "0.0.0.0";

/// Result of one update check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The server advertises a newer package
    Available(OmahaManifest),
    /// Up to date, or nothing usable in the reply
    NoUpdate,
    /// Transport failure or the server rejected the application
    Failed(String),
}

impl CheckOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, CheckOutcome::Available(_))
    }
}

/// Reads the version embedded in an installed file
pub trait VersionProbe: Send + Sync {
    fn installed_version(&self, path: &Path) -> Option<String>;
}

/// Reads `<file>.version`, a one-line text file shipped next to the binary
#[derive(Debug, Default, Clone)]
pub struct SidecarVersionProbe;

impl VersionProbe for SidecarVersionProbe {
    fn installed_version(&self, path: &Path) -> Option<String> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".version");
        let content = fs::read_to_string(PathBuf::from(sidecar)).ok()?;
        let version = content.lines().next()?.trim();
        (!version.is_empty()).then(|| version.to_string())
    }
}

/// Interpret an update-check reply body
pub fn interpret_response(app_id: &str, body: &str) -> CheckOutcome {
    let response = match OmahaResponse::from_xml(body) {
        Ok(response) => response,
        Err(e) => {
            warn!("Unreadable update response for {}: {}", app_id, e);
            return CheckOutcome::NoUpdate;
        }
    };

    if !response.is_app_ok() {
        return CheckOutcome::Failed(format!(
            "server status '{}'",
            response.app.status.as_deref().unwrap_or("")
        ));
    }

    match response.update_status() {
        Some(STATUS_OK) => match response.available_manifest() {
            Some(manifest) => CheckOutcome::Available(manifest.clone()),
            None => {
                warn!("Update for {} reported without a manifest", app_id);
                CheckOutcome::NoUpdate
            }
        },
        Some(STATUS_NO_UPDATE) => CheckOutcome::NoUpdate,
        other => {
            debug!("Unexpected update status {:?} for {}", other, app_id);
            CheckOutcome::NoUpdate
        }
    }
}

/// HTTP client for update checks
pub struct UpdateClient {
    http: reqwest::Client,
    client_id: String,
    channel: String,
    probe: Arc<dyn VersionProbe>,
}

impl UpdateClient {
    pub fn new(
        client_id: &str,
        channel: &str,
        timeout: Duration,
        probe: Arc<dyn VersionProbe>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            probe,
        })
    }

    /// Build the request for one tracked application
    pub fn build_request(&self, manifest: &UpdateManifest, version_directory: &Path) -> OmahaRequest {
        let tracked_file = version_directory.join(&manifest.app_path);
        let installed = self
            .probe
            .installed_version(&tracked_file)
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        OmahaRequest::update_check(&manifest.app_id, &installed, &self.channel, &self.client_id)
    }

    /// Check one tracked application
    pub async fn check(&self, manifest: &UpdateManifest, version_directory: &Path) -> CheckOutcome {
        let request = self.build_request(manifest, version_directory);
        let body = match request.to_xml() {
            Ok(body) => body,
            Err(e) => return CheckOutcome::Failed(e.to_string()),
        };

        debug!(
            "Checking {} (installed {}) at {}",
            manifest.app_id,
            request.app.version.as_deref().unwrap_or(UNKNOWN_VERSION),
            manifest.server_uri
        );

        let response = match self
            .http
            .post(&manifest.server_uri)
            .header(USER_AGENT, user_agent())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return CheckOutcome::Failed(format!("request failed: {}", e)),
        };

        if !response.status().is_success() {
            return CheckOutcome::Failed(format!("HTTP {}", response.status()));
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return CheckOutcome::Failed(format!("failed reading response: {}", e)),
        };

        let outcome = interpret_response(&manifest.app_id, &text);
        match &outcome {
            CheckOutcome::Available(m) => info!(
                "Update available for {}: {} ({})",
                manifest.app_id, m.version, m.package.name
            ),
            CheckOutcome::NoUpdate => info!("No update for {}", manifest.app_id),
            CheckOutcome::Failed(reason) => {
                warn!("Update check for {} failed: {}", manifest.app_id, reason)
            }
        }
        outcome
    }
}

/// User-Agent sent with every request
pub fn user_agent() -> String {
    format!(
        "Unattended/{} (update supervisor; {})",
        unattended_common::VERSION,
        std::env::consts::OS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AVAILABLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><response protocol="3.0" server="test"><app appid="sampleapp" status="ok"><updatecheck status="ok"><manifest version="1.0.0.1" trace="t-1"><url codebase="http://localhost/sampleapp.zip"></url><package hash="abcd" name="sampleapp.zip" size="10"></package></manifest></updatecheck></app></response>"#;

    const NO_UPDATE: &str = r#"<response protocol="3.0"><app appid="sampleapp" status="ok"><updatecheck status="noupdate"/></app></response>"#;

    fn manifest(server_uri: String) -> UpdateManifest {
        UpdateManifest {
            app_id: "sampleapp".to_string(),
            app_path: PathBuf::from("SampleApp.exe"),
            server_uri,
        }
    }

    fn client() -> UpdateClient {
        UpdateClient::new(
            "demo",
            "stable",
            Duration::from_secs(5),
            Arc::new(SidecarVersionProbe),
        )
        .unwrap()
    }

    #[test]
    fn test_interpret_statuses() {
        assert!(interpret_response("sampleapp", AVAILABLE).is_available());
        assert_eq!(interpret_response("sampleapp", NO_UPDATE), CheckOutcome::NoUpdate);

        let unknown = NO_UPDATE.replace("noupdate", "error-internal");
        assert_eq!(interpret_response("sampleapp", &unknown), CheckOutcome::NoUpdate);

        let rejected = AVAILABLE.replace(r#"appid="sampleapp" status="ok""#, r#"appid="sampleapp" status="restricted""#);
        assert!(matches!(
            interpret_response("sampleapp", &rejected),
            CheckOutcome::Failed(_)
        ));

        assert_eq!(interpret_response("sampleapp", "<html>oops"), CheckOutcome::NoUpdate);
    }

    #[test]
    fn test_sidecar_probe() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("SampleApp.exe");
        fs::write(&binary, "bin").unwrap();

        let probe = SidecarVersionProbe;
        assert_eq!(probe.installed_version(&binary), None);

        fs::write(temp.path().join("SampleApp.exe.version"), "1.2.3.4\n").unwrap();
        assert_eq!(probe.installed_version(&binary), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn test_build_request_uses_installed_version() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("SampleApp.exe.version"), "1.0.0.0").unwrap();

        let request = client().build_request(&manifest("http://localhost".into()), temp.path());
        assert_eq!(request.app.id, "sampleapp");
        assert_eq!(request.app.version.as_deref(), Some("1.0.0.0"));
        assert_eq!(request.app.channel.as_deref(), Some("stable"));
        assert_eq!(request.app.client_id.as_deref(), Some("demo"));

        let empty = TempDir::new().unwrap();
        let request = client().build_request(&manifest("http://localhost".into()), empty.path());
        assert_eq!(request.app.version.as_deref(), Some(UNKNOWN_VERSION));
    }

    #[tokio::test]
    async fn test_check_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update"))
            .and(header_exists("user-agent"))
            .and(body_string_contains(r#"appid="sampleapp""#))
            .and(body_string_contains(r#"eventtype="1" eventresult="7""#))
            .respond_with(ResponseTemplate::new(200).set_body_string(AVAILABLE))
            .expect(1)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let outcome = client()
            .check(&manifest(format!("{}/update", server.uri())), temp.path())
            .await;

        match outcome {
            CheckOutcome::Available(m) => {
                assert_eq!(m.version, "1.0.0.1");
                assert_eq!(m.package.name, "sampleapp.zip");
            }
            other => panic!("expected an update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_no_update() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(NO_UPDATE))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let outcome = client().check(&manifest(server.uri()), temp.path()).await;
        assert_eq!(outcome, CheckOutcome::NoUpdate);
    }

    #[tokio::test]
    async fn test_check_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let outcome = client().check(&manifest(server.uri()), temp.path()).await;
        assert!(matches!(outcome, CheckOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(NO_UPDATE)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = UpdateClient::new(
            "demo",
            "stable",
            Duration::from_millis(200),
            Arc::new(SidecarVersionProbe),
        )
        .unwrap();
        let temp = TempDir::new().unwrap();
        let outcome = client.check(&manifest(server.uri()), temp.path()).await;
        assert!(matches!(outcome, CheckOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_check_unreachable_server() {
        let temp = TempDir::new().unwrap();
        let outcome = client()
            .check(&manifest("http://127.0.0.1:9/update".to_string()), temp.path())
            .await;
        assert!(matches!(outcome, CheckOutcome::Failed(_)));
    }
}
