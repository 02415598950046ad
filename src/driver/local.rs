//! The local-filesystem driver: answers probes and serves requests by
//! shelling out to a `git` binary, the way `w4-rgit`'s `smart_git.rs` and
//! `git_cgi.rs` spawn `git http-backend` and bridge its CGI-style output
//! into an HTTP response.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use httparse::Status as HttpParseStatus;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::driver::{Driver, DriverResponse, ResponseHook};
use crate::error::{DriverError, DriverExecution};
use crate::request::{is_path_valid, RequestData, Service};

/// Per-service default policy for `enabled` when `git config` has no
/// explicit `daemon.<command>` setting and exits non-zero with empty
/// stdout.
#[derive(Debug, Clone, Default)]
pub struct EnabledDefaults {
    pub upload_pack: Option<bool>,
    pub receive_pack: Option<bool>,
}

impl EnabledDefaults {
    fn for_service(&self, service: Service) -> bool {
        let configured = match service {
            Service::UploadPack => self.upload_pack,
            Service::ReceivePack => self.receive_pack,
        };
        configured.unwrap_or(true)
    }
}

/// Serves repositories rooted under `origin` by invoking the system `git`.
pub struct LocalDriver {
    origin: PathBuf,
    defaults: EnabledDefaults,
}

impl LocalDriver {
    pub fn new(origin: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            defaults: EnabledDefaults::default(),
        }
    }

    pub fn with_defaults(origin: impl Into<PathBuf>, defaults: EnabledDefaults) -> Self {
        Self {
            origin: origin.into(),
            defaults,
        }
    }

    fn repo_path(&self, request: &RequestData) -> Option<PathBuf> {
        if !is_path_valid(&request.path) {
            return None;
        }
        Some(self.origin.join(&request.path))
    }

    fn daemon_config_key(service: Service) -> &'static str {
        match service {
            Service::UploadPack => "daemon.uploadpack",
            Service::ReceivePack => "daemon.receivepack",
        }
    }
}

#[async_trait]
impl Driver for LocalDriver {
    #[instrument(skip(self, _hook))]
    async fn exists(&self, request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
        let Some(repo_path) = self.repo_path(request) else {
            return Ok(false);
        };

        let status = Command::new("git")
            .arg("ls-remote")
            .arg(&repo_path)
            .arg("HEAD")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        Ok(status.success())
    }

    #[instrument(skip(self, _hook))]
    async fn access(&self, request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
        Ok(self.repo_path(request).is_some())
    }

    #[instrument(skip(self, _hook))]
    async fn enabled(&self, request: &RequestData, _hook: &ResponseHook) -> Result<bool, DriverError> {
        let Some(repo_path) = self.repo_path(request) else {
            return Ok(false);
        };
        let Some(service) = request.service else {
            return Ok(false);
        };

        let output = Command::new("git")
            .arg("-C")
            .arg(&repo_path)
            .arg("config")
            .arg("--bool")
            .arg(Self::daemon_config_key(service))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        if output.status.success() {
            let value = String::from_utf8_lossy(&output.stdout);
            let value = value.trim();
            return Ok(match service {
                // upload-pack: permissive default — enabled unless explicitly "false"
                Service::UploadPack => value != "false",
                // receive-pack: restrictive default — enabled only if explicitly "true"
                Service::ReceivePack => value == "true",
            });
        }

        if output.stdout.is_empty() {
            return Ok(self.defaults.for_service(service));
        }

        Err(DriverExecution {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into())
    }

    #[instrument(skip(self, request, _hook), fields(path = %request.path))]
    async fn serve(
        &self,
        request: &RequestData,
        _hook: &ResponseHook,
    ) -> Result<DriverResponse, DriverError> {
        if self.repo_path(request).is_none() {
            return Err(DriverExecution {
                exit_code: None,
                stderr: "invalid repository path".to_string(),
            }
            .into());
        }
        let Some(service) = request.service else {
            return Ok(DriverResponse::ok(Bytes::new()));
        };

        run_http_backend(&self.origin, request, service)
            .await
            .map_err(DriverError::from)
    }
}

/// Spawns `git http-backend` under CGI environment variables and bridges its
/// stdout (a CGI header block, then the body) into a [`DriverResponse`].
/// This is the generalized form of `smart_git.rs::handle`: that function
/// produced an `axum::Response` directly because it ran inside the HTTP
/// handler; here the headers are folded into the outgoing `Headers` via
/// `hook`-free direct construction since there's no streaming response body
/// once the subprocess exits (serve is expected to buffer, per §5).
async fn run_http_backend(
    origin: &Path,
    request: &RequestData,
    service: Service,
) -> Result<DriverResponse, anyhow::Error> {
    use anyhow::Context;

    let method = if request.is_advertisement { "GET" } else { "POST" };
    let suffix = if request.is_advertisement {
        "info/refs".to_string()
    } else {
        format!("git-{}", service.as_str())
    };
    let path_info = if request.path.is_empty() {
        format!("/{suffix}")
    } else {
        format!("/{}/{suffix}", request.path)
    };
    let query_string = if request.is_advertisement {
        format!("service=git-{}", service.as_str())
    } else {
        String::new()
    };

    let mut command = Command::new("git");
    command
        .arg("http-backend")
        .env("REQUEST_METHOD", method)
        .env("PATH_INFO", &path_info)
        .env("GIT_PROJECT_ROOT", origin)
        .env("QUERY_STRING", &query_string)
        .env("GIT_HTTP_EXPORT_ALL", "1");

    for (header, env) in [
        ("content-type", "CONTENT_TYPE"),
        ("content-length", "CONTENT_LENGTH"),
        ("git-protocol", "GIT_PROTOCOL"),
    ] {
        if let Some(value) = request.headers.get(header) {
            command.env(env, value);
        }
    }

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn git http-backend")?;

    let mut stdin = child.stdin.take().context("stdin already taken")?;
    {
        use tokio::io::AsyncWriteExt;
        stdin
            .write_all(&request.body)
            .await
            .context("failed to write request body to git http-backend stdin")?;
        drop(stdin);
    }

    let mut stdout = child.stdout.take().context("stdout already taken")?;
    let mut out_buf = BytesMut::with_capacity(1024);
    let headers = loop {
        let n = stdout
            .read_buf(&mut out_buf)
            .await
            .context("failed to read headers from git http-backend")?;
        if n == 0 {
            break None;
        }
        if let Some((body_offset, status_code, status_message)) = parse_cgi_headers(&out_buf)? {
            out_buf.advance(body_offset);
            break Some((status_code, status_message));
        }
    };

    loop {
        match stdout.read_buf(&mut out_buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let mut stderr_buf = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_end(&mut stderr_buf).await;
    }
    let status = child.wait().await.context("failed to wait on git http-backend")?;

    let Some((status_code, status_message)) = headers else {
        warn!(stderr = %String::from_utf8_lossy(&stderr_buf), "git http-backend produced no parseable headers");
        return Err(anyhow::anyhow!(
            "received incomplete response from git http-backend"
        ));
    };

    if !status.success() {
        debug!(stderr = %String::from_utf8_lossy(&stderr_buf), "git http-backend exited non-zero");
        return Err(DriverExecution {
            exit_code: status.code(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        }
        .into());
    }

    Ok(DriverResponse {
        body: out_buf.freeze(),
        status_code,
        status_message,
    })
}

/// Parses the CGI header block `git http-backend` writes ahead of its body,
/// lifting a `Status:` pseudo-header into a real status code — the same
/// bridging `smart_git.rs::parse_cgi_headers` does for an `axum::Response`.
fn parse_cgi_headers(buffer: &[u8]) -> Result<Option<(usize, u16, Option<String>)>, anyhow::Error> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 16];
    let (body_offset, raw_headers) = match httparse::parse_headers(buffer, &mut raw_headers)? {
        HttpParseStatus::Complete(v) => v,
        HttpParseStatus::Partial => return Ok(None),
    };

    let mut headers = HashMap::new();
    for header in raw_headers {
        headers.insert(
            header.name.to_ascii_lowercase(),
            String::from_utf8_lossy(header.value).into_owned(),
        );
    }

    let (status_code, status_message) = match headers.remove("status") {
        Some(status) if status.len() >= 3 => {
            let code = status[..3].parse::<u16>().unwrap_or(200);
            let message = status[3..].trim().to_string();
            (code, (!message.is_empty()).then_some(message))
        }
        _ => (200, None),
    };

    Ok(Some((body_offset, status_code, status_message)))
}
