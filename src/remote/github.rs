//! GitHub REST client: lists the source account's repositories and manages
//! their counterparts on the destination account.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{MirrorError, TransferError, TransferErrorKind};

use super::{DestinationRegistrar, DestinationRepo, RepositoryRef, SourceLister};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Repository payload (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct ApiRepository {
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    /// Kilobytes, as reported by the API.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub has_issues: bool,
    #[serde(default)]
    pub has_wiki: bool,
}

impl From<ApiRepository> for RepositoryRef {
    fn from(api: ApiRepository) -> Self {
        Self {
            full_name: api.full_name,
            clone_url: api.clone_url,
            size_bytes: api.size.saturating_mul(1024),
            private: api.private,
            description: api.description,
            has_issues: api.has_issues,
            has_wiki: api.has_wiki,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Serialize)]
struct CreateRepository<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
}

#[derive(Debug, Serialize)]
struct EditRepository<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
    has_issues: bool,
    has_wiki: bool,
}

/// Failure of one API call, before it is mapped onto the caller's taxonomy.
#[derive(Debug)]
pub struct ApiFailure {
    pub status: Option<StatusCode>,
    pub rate_limited: bool,
    pub message: String,
}

impl ApiFailure {
    pub fn kind(&self) -> TransferErrorKind {
        classify_status(self.status, self.rate_limited)
    }
}

impl From<ApiFailure> for TransferError {
    fn from(failure: ApiFailure) -> Self {
        TransferError::new(failure.kind(), failure.message)
    }
}

impl From<ApiFailure> for MirrorError {
    fn from(failure: ApiFailure) -> Self {
        match failure.kind() {
            TransferErrorKind::Auth => MirrorError::Auth(failure.message),
            _ => MirrorError::Remote(failure.message),
        }
    }
}

/// 404 is permanent; 401 and non-rate-limit 403 mean the token was rejected;
/// everything else (rate limits, 5xx, network) is worth another attempt.
pub fn classify_status(status: Option<StatusCode>, rate_limited: bool) -> TransferErrorKind {
    match status {
        Some(StatusCode::NOT_FOUND) => TransferErrorKind::NotFound,
        Some(StatusCode::TOO_MANY_REQUESTS) => TransferErrorKind::Transient,
        Some(StatusCode::FORBIDDEN) if rate_limited => TransferErrorKind::Transient,
        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => TransferErrorKind::Auth,
        _ => TransferErrorKind::Transient,
    }
}

/// Authenticated client for one GitHub account.
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Zeroizing<String>,
    per_page: u32,
    login: OnceCell<String>,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: &str, per_page: u32) -> Result<Self, MirrorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("repomirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MirrorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: Zeroizing::new(token.to_string()),
            per_page: per_page.clamp(1, 100),
            login: OnceCell::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(self.token.as_str())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, ApiFailure> {
        let response = builder.send().await.map_err(|e| ApiFailure {
            status: e.status(),
            rate_limited: false,
            message: format!("{what}: {e}"),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let rate_limited = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        let body = response.text().await.unwrap_or_default();
        Err(ApiFailure {
            status: Some(status),
            rate_limited,
            message: format!("{what}: HTTP {status}: {}", body.trim()),
        })
    }

    async fn json<T: DeserializeOwned>(&self, response: Response, what: &str) -> Result<T, ApiFailure> {
        response.json::<T>().await.map_err(|e| ApiFailure {
            status: None,
            rate_limited: false,
            message: format!("{what}: invalid response body: {e}"),
        })
    }

    /// Login of the token's owner. Doubles as token validation.
    pub async fn authenticated_login(&self) -> Result<String, MirrorError> {
        let login = self
            .login
            .get_or_try_init(|| async {
                let response = self.send(self.request(Method::GET, "/user"), "GET /user").await?;
                let user: ApiUser = self.json(response, "GET /user").await?;
                debug!(login = %user.login, "token accepted");
                Ok::<_, ApiFailure>(user.login)
            })
            .await?;
        Ok(login.clone())
    }

    async fn find_repo(&self, owner: &str, name: &str) -> Result<Option<ApiRepository>, ApiFailure> {
        let path = format!("/repos/{owner}/{name}");
        match self.send(self.request(Method::GET, &path), &format!("GET {path}")).await {
            Ok(response) => self.json(response, &path).await.map(Some),
            Err(failure) if failure.status == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(failure) => Err(failure),
        }
    }
}

#[async_trait::async_trait]
impl SourceLister for GitHubClient {
    async fn list_repositories(&self) -> Result<Vec<RepositoryRef>, MirrorError> {
        let mut repositories = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!(
                "/user/repos?affiliation=owner&sort=full_name&per_page={}&page={page}",
                self.per_page
            );
            let response = self
                .send(self.request(Method::GET, &path), "list repositories")
                .await?;
            let batch: Vec<ApiRepository> = self.json(response, "list repositories").await?;
            let fetched = batch.len();
            repositories.extend(batch.into_iter().map(RepositoryRef::from));
            if fetched < self.per_page as usize {
                break;
            }
            page += 1;
        }
        info!(count = repositories.len(), "listed source repositories");
        Ok(repositories)
    }
}

#[async_trait::async_trait]
impl DestinationRegistrar for GitHubClient {
    async fn get_or_create(&self, source: &RepositoryRef) -> Result<DestinationRepo, TransferError> {
        let owner = self.authenticated_login().await.map_err(|e| match e {
            MirrorError::Auth(message) => TransferError::auth(message),
            other => TransferError::transient(other.to_string()),
        })?;
        let name = source.name();

        if let Some(existing) = self.find_repo(&owner, name).await? {
            debug!(repo = %existing.full_name, "destination exists");
            return Ok(DestinationRepo {
                full_name: existing.full_name,
                clone_url: existing.clone_url,
            });
        }

        let body = CreateRepository {
            name,
            description: source.description.as_deref().unwrap_or_default(),
            private: source.private,
        };
        let response = self
            .send(
                self.request(Method::POST, "/user/repos").json(&body),
                &format!("create {owner}/{name}"),
            )
            .await?;
        let created: ApiRepository = self.json(response, "create repository").await?;
        info!(repo = %created.full_name, private = source.private, "created destination repository");
        Ok(DestinationRepo {
            full_name: created.full_name,
            clone_url: created.clone_url,
        })
    }

    async fn sync_settings(
        &self,
        source: &RepositoryRef,
        destination: &DestinationRepo,
    ) -> Result<(), TransferError> {
        let name = source.name();
        let body = EditRepository {
            name,
            description: source.description.as_deref().unwrap_or_default(),
            private: source.private,
            has_issues: source.has_issues,
            has_wiki: source.has_wiki,
        };
        let path = format!("/repos/{}", destination.full_name);
        self.send(
            self.request(Method::PATCH, &path).json(&body),
            &format!("PATCH {path}"),
        )
        .await?;
        debug!(repo = %destination.full_name, "settings synchronized");
        Ok(())
    }
}
