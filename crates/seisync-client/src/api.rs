//! SEI API bindings.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::debug;

use seisync_core::{defaults, ActivityRecord, NewDocumentRef, ProcessRecord};

use crate::config::ClientConfig;
use crate::error::{ApiError, ApiResult};
use crate::session::SessionManager;
use crate::stats::StatsSnapshot;
use crate::transport::{ApiRequest, Transport};
use crate::types::{
    activity_from_json, document_ref_from_json, process_record_from_json, value_text, Page,
};
use crate::units::{Unit, UnitDirectory};

static FILENAME_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename="([^"]+)""#).expect("valid regex"));
static FILENAME_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"filename=([^\s;]+)").expect("valid regex"));

/// File name from a `Content-Disposition` header value.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    FILENAME_QUOTED
        .captures(header)
        .or_else(|| FILENAME_BARE.captures(header))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

/// A downloaded document body.
#[derive(Debug, Clone)]
pub struct DownloadedDocument {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// File name announced by the server, if any.
    pub filename: Option<String>,
}

/// Typed SEI client.
///
/// Metadata calls and downloads go through separate transports with
/// their own permit pools; both share one [`SessionManager`].
pub struct SeiClient {
    session: Arc<SessionManager>,
    metadata: Transport,
    downloads: Transport,
}

impl SeiClient {
    /// Build a client. Fails on invalid configuration; no call is made
    /// until the first request.
    pub fn new(config: ClientConfig) -> seisync_core::Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| seisync_core::Error::Config(format!("HTTP client: {}", e)))?;

        let max_concurrent = config.max_concurrent;
        let max_downloads = config.max_concurrent_downloads;
        let session = Arc::new(SessionManager::new(http.clone(), Arc::new(config)));

        Ok(Self {
            metadata: Transport::new("metadata", http.clone(), session.clone(), max_concurrent),
            downloads: Transport::new("downloads", http, session.clone(), max_downloads),
            session,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn metadata_transport(&self) -> &Transport {
        &self.metadata
    }

    pub fn download_transport(&self) -> &Transport {
        &self.downloads
    }

    /// Counters of both transports, metadata first.
    pub fn stats(&self) -> (StatsSnapshot, StatsSnapshot) {
        (self.metadata.stats().snapshot(), self.downloads.stats().snapshot())
    }

    /// Log in if needed and return the unit directory. Transient login
    /// failures are retried under the metadata transport's policy.
    pub async fn units(&self) -> ApiResult<Arc<UnitDirectory>> {
        self.metadata.units().await
    }

    /// Unit ids to try for a work item scope.
    pub async fn unit_candidates(&self, scope: &str) -> ApiResult<Vec<String>> {
        let directory = self.metadata.units().await?;
        Ok(directory.candidates(scope, self.session.config().default_unit.as_deref()))
    }

    /// Process metadata (`procedimentos/consulta`).
    pub async fn fetch_process(&self, unit: &str, protocol: &str) -> ApiResult<ProcessRecord> {
        let request = ApiRequest::get(format!("/v1/unidades/{}/procedimentos/consulta", unit))
            .query("protocolo_procedimento", protocol)
            .query("sin_retornar_atributos", "N")
            .query("sinal_completo", "S");
        let body: JsonValue = self.metadata.call(&request).await?.json()?;
        if !body.is_object() {
            return Err(ApiError::Decode(format!(
                "process {} answered a non-object body",
                protocol
            )));
        }
        Ok(process_record_from_json(protocol, unit, body))
    }

    /// Document listing of a process (`procedimentos/documentos`).
    pub async fn list_documents(
        &self,
        unit: &str,
        protocol: &str,
    ) -> ApiResult<Vec<NewDocumentRef>> {
        let request = ApiRequest::get(format!("/v1/unidades/{}/procedimentos/documentos", unit))
            .query("protocolo_procedimento", protocol)
            .query("quantidade", defaults::DOCUMENTS_PAGE_SIZE);
        let entries = self.paginate(request, "Documentos").await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| document_ref_from_json(protocol, unit, entry))
            .collect())
    }

    /// Activity history of a process (`procedimentos/andamentos`).
    pub async fn list_activities(
        &self,
        unit: &str,
        protocol: &str,
    ) -> ApiResult<Vec<ActivityRecord>> {
        let request = ApiRequest::get(format!("/v1/unidades/{}/procedimentos/andamentos", unit))
            .query("protocolo_procedimento", protocol)
            .query("quantidade", defaults::ACTIVITIES_PAGE_SIZE)
            .query("sinal_atributos", "S");
        let entries = self.paginate(request, "Andamentos").await?;
        Ok(entries
            .into_iter()
            .map(|entry| activity_from_json(protocol, entry))
            .collect())
    }

    /// Binary content of a document (`documentos/baixar`).
    pub async fn download_document(
        &self,
        unit: &str,
        document_id: &str,
    ) -> ApiResult<DownloadedDocument> {
        let request = ApiRequest::get(format!("/v1/unidades/{}/documentos/baixar", unit))
            .query("protocolo_documento", document_id);
        let response = self.downloads.call(&request).await?;
        Ok(DownloadedDocument {
            content_type: response
                .header("content-type")
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
                .filter(|ct| !ct.is_empty()),
            filename: response
                .header("content-disposition")
                .and_then(filename_from_disposition),
            bytes: response.body,
        })
    }

    /// Units visible to the service account (`GET /v1/unidades`).
    pub async fn list_units(&self) -> ApiResult<Vec<Unit>> {
        let body: JsonValue = self.metadata.call(&ApiRequest::get("/v1/unidades")).await?.json()?;
        let entries = match body {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("unidades").or_else(|| map.remove("Unidades")) {
                Some(JsonValue::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(entries
            .iter()
            .filter_map(|u| {
                let id = value_text(u, "IdUnidade", &[]).or_else(|| value_text(u, "Id", &[]))?;
                let label = value_text(u, "Sigla", &[]).unwrap_or_default();
                Some(Unit::new(id, label))
            })
            .collect())
    }

    /// Fetch page 1, then the remaining pages concurrently. Any failed
    /// page fails the listing.
    async fn paginate(&self, request: ApiRequest, items_key: &str) -> ApiResult<Vec<JsonValue>> {
        let first: JsonValue = self
            .metadata
            .call(&request.clone().query("pagina", 1))
            .await?
            .json()?;
        let first = Page::from_json(first, items_key);
        let total_pages = first.total_pages;
        let mut items = first.items;

        if total_pages > 1 {
            debug!(
                subsystem = "sei",
                component = "client",
                path = %request.path,
                total_pages,
                "Fetching remaining pages"
            );
            let pages = try_join_all((2..=total_pages).map(|page| {
                let request = request.clone().query("pagina", page);
                async move {
                    let body: JsonValue = self.metadata.call(&request).await?.json()?;
                    Ok::<_, ApiError>(Page::from_json(body, items_key).items)
                }
            }))
            .await?;
            items.extend(pages.into_iter().flatten());
        }

        Ok(items)
    }
}
