//! Client for the request/response endpoints the workbench calls beside the
//! chat stream: station listing, similarity search, coverage estimates and
//! selection reports.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::ResultExt;

use crate::error::{
    AgentResult, BuildHttpClientSnafu, DecodeResponseSnafu, RejectedSnafu, ResponseStatusSnafu,
    SendRequestSnafu,
};
use crate::settings::Settings;

pub const SELECTION_PATH: &str = "/api/geo/selection";
pub const STATIONS_PATH: &str = "/api/geo/stations";
pub const SEARCH_PATH: &str = "/api/db/stations/search";
pub const COVERAGE_PATH: &str = "/api/geo/coverage";
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Base station record as served by the geo and db endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            city: None,
            vendor: None,
            band: None,
            status: None,
            lat: None,
            lng: None,
            desc: None,
            extra: Map::new(),
        }
    }

    /// Name when known, otherwise the id.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageEstimate {
    pub station: Station,
    pub radius_m: f64,
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
struct SelectionReport<'a> {
    station_id: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StationsResponse {
    #[serde(default)]
    stations: Vec<Station>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<Station>,
}

#[derive(Debug, Deserialize)]
struct CoverageResponse {
    #[serde(default)]
    ok: bool,
    station: Option<Station>,
    #[serde(default)]
    radius_m: f64,
    address: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
pub struct CollaboratorClient {
    client: reqwest::Client,
    settings: Arc<Settings>,
}

impl CollaboratorClient {
    pub fn new(settings: Arc<Settings>) -> AgentResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = settings.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context(BuildHttpClientSnafu {
            stage: "build-collaborator-client",
        })?;
        Ok(Self { client, settings })
    }

    /// Tells the backend which station the operator picked.
    pub async fn report_selection(&self, station_id: &str) -> AgentResult<()> {
        let url = self.settings.endpoint(SELECTION_PATH);
        let response = self
            .client
            .post(&url)
            .json(&SelectionReport {
                station_id,
                session_id: &self.settings.session_id,
            })
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "send-selection-report",
                url: url.clone(),
            })?;
        ensure_success(response, &url, "selection-report-status").await?;
        tracing::debug!(station_id, "reported station selection");
        Ok(())
    }

    /// Reports a selection in the background; failures are only logged.
    ///
    /// Must be called from within a tokio runtime.
    pub fn report_selection_detached(&self, station_id: &str) {
        let client = self.clone();
        let station_id = station_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = client.report_selection(&station_id).await {
                tracing::debug!(station_id, error = %error, "selection report failed");
            }
        });
    }

    pub async fn list_stations(&self, city: &str) -> AgentResult<Vec<Station>> {
        let response: StationsResponse = self
            .get_json(STATIONS_PATH, &[("city", city.to_string())], "list-stations")
            .await?;
        Ok(response.stations)
    }

    pub async fn search_stations(&self, query: &str, limit: usize) -> AgentResult<Vec<Station>> {
        let response: SearchResponse = self
            .get_json(
                SEARCH_PATH,
                &[("q", query.to_string()), ("k", limit.to_string())],
                "search-stations",
            )
            .await?;
        Ok(response.matches)
    }

    pub async fn coverage(&self, station_id: &str) -> AgentResult<CoverageEstimate> {
        let url = self.settings.endpoint(COVERAGE_PATH);
        let response: CoverageResponse = self
            .get_json(
                COVERAGE_PATH,
                &[("station_id", station_id.to_string())],
                "estimate-coverage",
            )
            .await?;

        if !response.ok {
            return RejectedSnafu {
                stage: "estimate-coverage",
                url,
                message: response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            }
            .fail();
        }
        let Some(station) = response.station else {
            return RejectedSnafu {
                stage: "estimate-coverage",
                url,
                message: "response carried no station".to_string(),
            }
            .fail();
        };

        Ok(CoverageEstimate {
            station,
            radius_m: response.radius_m,
            address: response.address,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        stage: &'static str,
    ) -> AgentResult<T> {
        let url = self.settings.endpoint(path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .context(SendRequestSnafu {
                stage,
                url: url.clone(),
            })?;
        let response = ensure_success(response, &url, stage).await?;
        response
            .json::<T>()
            .await
            .context(DecodeResponseSnafu { stage, url })
    }
}

pub(crate) async fn ensure_success(
    response: reqwest::Response,
    url: &str,
    stage: &'static str,
) -> AgentResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    ResponseStatusSnafu {
        stage,
        url,
        status: status.as_u16(),
        body,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn station_keeps_unknown_fields() {
        let station: Station = serde_json::from_value(json!({
            "id": "BJ-001",
            "name": "Chaoyang Park",
            "lat": 39.94,
            "lng": 116.47,
            "load": 0.72
        }))
        .unwrap();
        assert_eq!(station.label(), "Chaoyang Park");
        assert_eq!(station.lat, Some(39.94));
        assert_eq!(station.extra.get("load"), Some(&json!(0.72)));

        let value = serde_json::to_value(&station).unwrap();
        assert_eq!(value["load"], json!(0.72));
        assert!(value.get("vendor").is_none());
    }

    #[test]
    fn label_falls_back_to_id() {
        assert_eq!(Station::new("SH-9", " ").label(), "SH-9");
    }

    #[test]
    fn selection_report_wire_shape() {
        let report = SelectionReport {
            station_id: "BJ-001",
            session_id: "demo",
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({"station_id": "BJ-001", "session_id": "demo"})
        );
    }

    #[test]
    fn coverage_response_tolerates_failure_shape() {
        let response: CoverageResponse =
            serde_json::from_value(json!({"ok": false, "error": "station not found"})).unwrap();
        assert!(!response.ok);
        assert!(response.station.is_none());
        assert_eq!(response.error.as_deref(), Some("station not found"));
    }
}
