//! HTTP account setup against the review service: login, key installation,
//! password resolution and project creation.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{Span, debug, warn};

use crate::config::{Config, ConfigError, validate_username};
use crate::container::Endpoint;

/// Guard line prepended to every JSON response body.
pub const MAGIC_PREFIX: &str = ")]}'";

const XSRF_COOKIE: &str = "XSRF_TOKEN";

/// Errors raised while talking to the review service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AccountError {
    /// Raised before any request when the settings are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the service answers with a status other than the one the
    /// operation requires.
    #[error("Response code {observed} != {expected}")]
    UnexpectedStatus {
        /// Status returned by the service.
        observed: u16,
        /// Status the operation requires.
        expected: u16,
    },
    /// Raised when a request cannot be sent or its body cannot be read.
    #[error("{method} {url} failed: {message}")]
    Transport {
        /// HTTP method.
        method: String,
        /// Request URL.
        url: String,
        /// Underlying error.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("failed to decode response from {url}: {message}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decoder error.
        message: String,
    },
    /// Raised when the service generates an empty password.
    #[error("service generated an empty password")]
    EmptyPassword,
}

/// Account details returned by `GET /a/accounts/self`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountInfo {
    /// Numeric account identifier.
    #[serde(rename = "_account_id", default)]
    pub account_id: Option<u64>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Login name.
    #[serde(default)]
    pub username: Option<String>,
    /// Preferred email.
    #[serde(default)]
    pub email: Option<String>,
}

enum Payload {
    Empty,
    Json(Value),
    Text(String),
}

/// Cookie-holding HTTP client bound to one account on one service.
#[derive(Clone, Debug)]
pub struct HttpSession {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    user: String,
    span: Span,
}

impl HttpSession {
    /// Creates a session for `username` against `endpoint`. No request is
    /// issued.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Config`] when `username` is blank, before any
    /// request is issued, and [`AccountError::Transport`] when the client
    /// cannot be built.
    pub fn new(endpoint: &Endpoint, username: &str, span: Span) -> Result<Self, AccountError> {
        let user = validate_username(username)?.to_owned();
        let prefix = endpoint.http_url();
        let base = Url::parse(&prefix).map_err(|err| AccountError::Transport {
            method: String::from("CONNECT"),
            url: prefix.clone(),
            message: err.to_string(),
        })?;
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|err| AccountError::Transport {
                method: String::from("CONNECT"),
                url: prefix,
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            jar,
            base,
            user,
            span,
        })
    }

    /// Login name used for every request.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Base URL of the service.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear();
            path.extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Payload,
        expected: StatusCode,
    ) -> Result<String, AccountError> {
        let url = self.url_for(segments);
        let authenticated = segments.first() == Some(&"a");
        let mut request = self.client.request(method.clone(), url.clone());
        if !authenticated {
            request = request.header("X-User", &self.user);
        }
        if let Some(token) = self.xsrf_token() {
            request = request.header("X-Gerrit-Auth", token);
        }
        request = match body {
            Payload::Empty => request,
            Payload::Json(value) => request.json(&value),
            Payload::Text(text) => request.header("Content-Type", "text/plain").body(text),
        };

        debug!(parent: &self.span, kind = "request", method = %method, url = %url);
        let transport = |err: reqwest::Error| AccountError::Transport {
            method: method.to_string(),
            url: url.to_string(),
            message: err.to_string(),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        debug!(
            parent: &self.span,
            kind = "response",
            method = %method,
            url = %url,
            status = status.as_u16(),
            status_expected = expected.as_u16(),
        );
        if status != expected {
            return Err(AccountError::UnexpectedStatus {
                observed: status.as_u16(),
                expected: expected.as_u16(),
            });
        }
        response.text().await.map_err(transport)
    }

    fn xsrf_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let cookies = header.to_str().ok()?;
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == XSRF_COOKIE).then(|| value.to_owned())
        })
    }

    /// Polls `GET /config/server/version` until it answers 200. The caller's
    /// deadline bounds the wait.
    pub async fn wait_until_ready(&self, poll: Duration) {
        loop {
            match self
                .send(Method::GET, &["config", "server", "version"], Payload::Empty, StatusCode::OK)
                .await
            {
                Ok(_) => return,
                Err(err) => {
                    debug!(parent: &self.span, phase = "setup", task = "http", action = "wait", error = %err);
                    sleep(poll).await;
                }
            }
        }
    }

    /// Logs in as the session user through `GET /login/`.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when the request fails or is not answered
    /// with 200.
    pub async fn login(&self) -> Result<(), AccountError> {
        self.send(Method::GET, &["login", ""], Payload::Empty, StatusCode::OK)
            .await
            .map(|_| ())
    }

    /// Installs `public_key` on the logged-in account.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] unless the service answers 201.
    pub async fn insert_public_key(&self, public_key: &str) -> Result<(), AccountError> {
        self.send(
            Method::POST,
            &["a", "accounts", "self", "sshkeys"],
            Payload::Text(public_key.trim().to_owned()),
            StatusCode::CREATED,
        )
        .await
        .map(|_| ())
    }

    /// Sets the account's HTTP password.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] unless the service answers 200.
    pub async fn set_password(&self, password: &str) -> Result<(), AccountError> {
        self.send(
            Method::PUT,
            &["a", "accounts", "self", "password.http"],
            Payload::Json(json!({ "http_password": password })),
            StatusCode::OK,
        )
        .await
        .map(|_| ())
    }

    /// Asks the service to generate an HTTP password and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] unless the service answers 200 with a
    /// non-empty password.
    pub async fn generate_password(&self) -> Result<String, AccountError> {
        let body = self
            .send(
                Method::PUT,
                &["a", "accounts", "self", "password.http"],
                Payload::Json(json!({ "generate": true })),
                StatusCode::OK,
            )
            .await?;
        let stripped = strip_magic_prefix(&body).trim();
        let password = serde_json::from_str::<String>(stripped)
            .unwrap_or_else(|_| stripped.trim_matches('"').to_owned());
        if password.is_empty() {
            return Err(AccountError::EmptyPassword);
        }
        Ok(password)
    }

    /// Fetches the logged-in account.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] unless the service answers 200 with an
    /// account document.
    pub async fn get_account(&self) -> Result<AccountInfo, AccountError> {
        let body = self
            .send(
                Method::GET,
                &["a", "accounts", "self"],
                Payload::Empty,
                StatusCode::OK,
            )
            .await?;
        decode(&body, &self.url_for(&["a", "accounts", "self"]))
    }

    /// Creates `name` with an initial empty commit.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] unless the service answers 201.
    pub async fn create_project(&self, name: &str) -> Result<(), AccountError> {
        self.send(
            Method::PUT,
            &["a", "projects", name],
            Payload::Json(json!({ "create_empty_commit": true })),
            StatusCode::CREATED,
        )
        .await
        .map(|_| ())
    }
}

fn decode<T: DeserializeOwned>(body: &str, url: &Url) -> Result<T, AccountError> {
    serde_json::from_str(strip_magic_prefix(body)).map_err(|err| AccountError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

/// Removes the `)]}'` guard line from a JSON response body.
#[must_use]
pub fn strip_magic_prefix(body: &str) -> &str {
    body.strip_prefix(MAGIC_PREFIX)
        .map_or(body, |rest| rest.trim_start_matches(['\r', '\n']))
}

/// Runs the account stage: waits for the service, logs in, installs the
/// public key, resolves the password and creates the configured project.
///
/// An explicit password is set on the account; when setting it fails the
/// current account is fetched instead. Without one the service generates a
/// password, which is written back into `config`.
///
/// # Errors
///
/// Returns [`AccountError`] for the first step that fails.
pub async fn provision(
    session: &HttpSession,
    config: &mut Config,
    public_key: &str,
    span: &Span,
) -> Result<(), AccountError> {
    session
        .wait_until_ready(config.readiness_poll_interval())
        .await;
    debug!(parent: span, phase = "setup", task = "http", action = "login", user = session.user());
    session.login().await?;
    session.insert_public_key(public_key).await?;

    if let Some(password) = config.explicit_password().map(str::to_owned) {
        debug!(parent: span, phase = "setup", task = "http", action = "set-password");
        if let Err(err) = session.set_password(&password).await {
            warn!(
                parent: span,
                phase = "setup",
                task = "http",
                action = "set-password",
                error = %err,
                "setting the password failed; checking the account instead",
            );
            session.get_account().await?;
        }
    } else {
        debug!(parent: span, phase = "setup", task = "http", action = "generate-password");
        config.password = Some(session.generate_password().await?);
    }

    if let Some(project) = config.project.as_deref().filter(|name| !name.is_empty()) {
        debug!(parent: span, phase = "setup", task = "http", action = "create-project", project);
        session.create_project(project).await?;
    }
    Ok(())
}
