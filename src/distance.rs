//! Road distance lookups.
//!
//! The service answers one origin against N destinations and returns N
//! distances in meters, in destination order. A destination it cannot route
//! is `None`; callers exclude it rather than treat it as zero.

use std::time::Duration;

use serde::Deserialize;

use crate::{catalog::GeoPoint, config::DistanceConfig};

/// Google Distance Matrix caps destinations per request.
const MAX_DESTINATIONS_PER_REQUEST: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum DistanceError {
    #[error("distance service unreachable: {0}")]
    Unreachable(String),

    #[error("distance service rejected the request: {0}")]
    Rejected(String),

    #[error("malformed distance response: {0}")]
    Malformed(String),
}

pub trait DistanceService: Send + Sync {
    fn distances(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, DistanceError>;
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
struct MatrixElement {
    status: String,
    #[serde(default)]
    distance: Option<MatrixValue>,
}

#[derive(Debug, Deserialize)]
struct MatrixValue {
    value: f64,
}

/// HTTP client for a Distance Matrix compatible endpoint.
pub struct DistanceMatrixClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl DistanceMatrixClient {
    pub fn new(config: &DistanceConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn format_point(point: &GeoPoint) -> String {
        format!("{},{}", point.lat, point.lng)
    }

    fn request_chunk(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, DistanceError> {
        let destinations_param = destinations
            .iter()
            .map(Self::format_point)
            .collect::<Vec<_>>()
            .join("|");

        let mut query = vec![
            ("origins", Self::format_point(&origin)),
            ("destinations", destinations_param),
            ("units", "metric".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .map_err(|e| DistanceError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DistanceError::Unreachable(format!("http status {status}")));
        }

        let body: MatrixResponse = response
            .json()
            .map_err(|e| DistanceError::Malformed(e.to_string()))?;

        if body.status != "OK" {
            let reason = body.error_message.unwrap_or(body.status);
            return Err(DistanceError::Rejected(reason));
        }

        let row = body
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| DistanceError::Malformed("response has no rows".into()))?;

        if row.elements.len() != destinations.len() {
            return Err(DistanceError::Malformed(format!(
                "expected {} elements, got {}",
                destinations.len(),
                row.elements.len()
            )));
        }

        Ok(row
            .elements
            .into_iter()
            .map(|el| match (el.status.as_str(), el.distance) {
                ("OK", Some(d)) if d.value.is_finite() && d.value >= 0.0 => Some(d.value),
                _ => None,
            })
            .collect())
    }
}

impl DistanceService for DistanceMatrixClient {
    fn distances(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, DistanceError> {
        let mut out = Vec::with_capacity(destinations.len());
        for chunk in destinations.chunks(MAX_DESTINATIONS_PER_REQUEST) {
            out.extend(self.request_chunk(origin, chunk)?);
        }
        log::debug!("resolved {} distances", out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(url: String) -> DistanceMatrixClient {
        DistanceMatrixClient::new(&DistanceConfig {
            endpoint: url,
            api_key: Some("test-key".into()),
            timeout_secs: 2,
        })
        .unwrap()
    }

    fn point(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    #[test]
    fn test_distances_in_destination_order() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/matrix")
                .query_param("origins", "17.4,78.4")
                .query_param("destinations", "17.41,78.41|17.5,78.5")
                .query_param("key", "test-key");
            then.status(200).json_body(json!({
                "status": "OK",
                "rows": [{ "elements": [
                    { "status": "OK", "distance": { "value": 1200.0, "text": "1.2 km" } },
                    { "status": "ZERO_RESULTS" }
                ]}]
            }));
        });

        let got = client(server.url("/matrix"))
            .distances(point(17.4, 78.4), &[point(17.41, 78.41), point(17.5, 78.5)])
            .unwrap();

        mock.assert();
        assert_eq!(got, vec![Some(1200.0), None]);
    }

    #[test]
    fn test_large_requests_are_chunked() {
        let server = MockServer::start();
        let elements: Vec<_> = (0..25)
            .map(|_| json!({ "status": "OK", "distance": { "value": 10.0 } }))
            .collect();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/matrix");
            then.status(200)
                .json_body(json!({ "status": "OK", "rows": [{ "elements": elements }] }));
        });

        let destinations: Vec<_> = (0..50).map(|i| point(17.0 + i as f64 * 0.001, 78.0)).collect();
        let got = client(server.url("/matrix"))
            .distances(point(17.4, 78.4), &destinations)
            .unwrap();

        mock.assert_hits(2);
        assert_eq!(got.len(), 50);
    }

    #[test]
    fn test_denied_request_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/matrix");
            then.status(200).json_body(json!({
                "status": "REQUEST_DENIED",
                "error_message": "The provided API key is invalid."
            }));
        });

        let err = client(server.url("/matrix"))
            .distances(point(17.4, 78.4), &[point(17.41, 78.41)])
            .unwrap_err();
        assert!(matches!(err, DistanceError::Rejected(msg) if msg.contains("API key")));
    }

    #[test]
    fn test_element_count_mismatch() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/matrix");
            then.status(200)
                .json_body(json!({ "status": "OK", "rows": [{ "elements": [] }] }));
        });

        let err = client(server.url("/matrix"))
            .distances(point(17.4, 78.4), &[point(17.41, 78.41)])
            .unwrap_err();
        assert!(matches!(err, DistanceError::Malformed(_)));
    }

    #[test]
    fn test_unreachable_service() {
        let err = client("http://127.0.0.1:1/matrix".into())
            .distances(point(17.4, 78.4), &[point(17.41, 78.41)])
            .unwrap_err();
        assert!(matches!(err, DistanceError::Unreachable(_)));
    }
}
