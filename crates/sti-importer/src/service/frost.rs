//! HTTP client for a SensorThings (FROST) server

use super::{EntityService, Page, Query, ServiceError};
use crate::model::{Entity, EntityId};
use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

const USER_AGENT: &str = concat!("sti-importer/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct ListResponse<E> {
    #[serde(default = "Vec::new")]
    value: Vec<E>,
    #[serde(rename = "@iot.nextLink")]
    next_link: Option<String>,
}

/// SensorThings API client
///
/// In dry-run mode reads go to the server as usual while creates and
/// updates are only logged. Entities "created" in dry-run mode get
/// negative placeholder ids so that references between them still resolve.
pub struct FrostClient {
    client: Client,
    base_url: Url,
    dry_run: bool,
    placeholder_ids: AtomicI64,
}

impl FrostClient {
    /// Create a client for the service root, e.g. `http://host/FROST-Server/v1.1`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let parsed = Url::parse(&normalized).map_err(|e| ServiceError::Transport {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| transport(&parsed, e))?;

        Ok(Self {
            client,
            base_url: parsed,
            dry_run: false,
            placeholder_ids: AtomicI64::new(0),
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url.join(path).map_err(|e| ServiceError::Transport {
            url: format!("{}{}", self.base_url, path),
            message: e.to_string(),
        })
    }

    fn query_url(&self, query: &Query) -> Result<Url, ServiceError> {
        let mut url = self.url_for(query.path())?;
        let options = query.options();
        if !options.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &options {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn get_page<E: Entity>(&self, url: Url) -> Result<Page<E>, ServiceError> {
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let response = check_status("GET", &url, response).await?;

        let body: ListResponse<E> = response.json().await.map_err(|e| ServiceError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        Ok(Page {
            values: body.value,
            next_link: body.next_link,
        })
    }

    fn next_placeholder_id(&self) -> EntityId {
        EntityId::Number(-(self.placeholder_ids.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

fn transport(url: &Url, err: reqwest::Error) -> ServiceError {
    ServiceError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}

async fn check_status(
    method: &'static str,
    url: &Url,
    response: Response,
) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl EntityService for FrostClient {
    async fn query<E: Entity>(&self, query: &Query) -> Result<Page<E>, ServiceError> {
        let url = self.query_url(query)?;
        self.get_page(url).await
    }

    async fn next_page<E: Entity>(&self, next_link: &str) -> Result<Page<E>, ServiceError> {
        let url = Url::parse(next_link).map_err(|e| ServiceError::Decode {
            url: next_link.to_string(),
            message: format!("invalid next link: {}", e),
        })?;
        self.get_page(url).await
    }

    async fn create<E: Entity>(&self, entity: &E) -> Result<E, ServiceError> {
        let url = self.url_for(E::ENTITY_SET)?;
        let mut created = entity.clone();

        if self.dry_run {
            let id = self.next_placeholder_id();
            info!(entity_set = E::ENTITY_SET, placeholder = %id, "Dry run, not creating entity");
            created.set_id(id);
            return Ok(created);
        }

        debug!(url = %url, "POST");
        let response = self
            .client
            .post(url.clone())
            .json(entity)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let response = check_status("POST", &url, response).await?;

        let from_location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(EntityId::from_self_link);

        let id = match from_location {
            Some(id) => id,
            None => {
                let body = response.text().await.map_err(|e| transport(&url, e))?;
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("@iot.id").cloned())
                    .and_then(|v| serde_json::from_value::<EntityId>(v).ok())
                    .ok_or(ServiceError::MissingId(E::ENTITY_SET))?
            }
        };

        created.set_id(id);
        Ok(created)
    }

    async fn update<E: Entity>(&self, entity: &E) -> Result<(), ServiceError> {
        let id = entity
            .id()
            .ok_or(ServiceError::NoIdForUpdate(E::ENTITY_SET))?;

        if self.dry_run {
            info!(entity_set = E::ENTITY_SET, id = %id, "Dry run, not updating entity");
            return Ok(());
        }

        let url = self.url_for(&format!("{}({})", E::ENTITY_SET, id.literal()))?;
        debug!(url = %url, "PATCH");
        let response = self
            .client
            .patch(url.clone())
            .json(entity)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        check_status("PATCH", &url, response).await?;
        Ok(())
    }
}
