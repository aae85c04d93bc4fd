use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

#[derive(Clone, Debug)]
pub struct HaClient {
    http: Client,
    base_url: Url,
    token: String,
    entity_id: String,
}

impl HaClient {
    pub fn new(
        base_url: &str,
        token: &str,
        entity_id: &str,
        timeout: Duration,
    ) -> Result<Self, HaError> {
        if token.trim().is_empty() {
            return Err(HaError::Config("home assistant token must not be empty"));
        }
        if entity_id.trim().is_empty() {
            return Err(HaError::Config(
                "home assistant entity_id must not be empty",
            ));
        }

        let mut parsed = Url::parse(base_url.trim()).map_err(|err| HaError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HaError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            token: token.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Current state string of the entity (`"on"`, `"off"`, ...).
    pub async fn get_state(&self) -> Result<String, HaError> {
        let req = self.build_get_state_request()?;
        let resp = self.http.execute(req).await.map_err(HaError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(HaError::Http)?;
        parse_state_response(status, &body)
    }

    /// Flip the entity via the matching `input_boolean` service call.
    /// One request per invocation; the caller decides when a change is
    /// worth sending.
    pub async fn set_mic_active(&self, active: bool) -> Result<(), HaError> {
        let req = self.build_set_state_request(active)?;
        let resp = self.http.execute(req).await.map_err(HaError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(HaError::Http)?;
        parse_set_state_response(status, &body)
    }

    pub fn build_get_state_request(&self) -> Result<Request, HaError> {
        let path = format!("api/states/{}", self.entity_id);
        self.build_request_builder(Method::GET, &path)?
            .build()
            .map_err(HaError::Http)
    }

    pub fn build_set_state_request(&self, active: bool) -> Result<Request, HaError> {
        let path = format!("api/services/input_boolean/{}", service_action(active));
        let body = serde_json::to_vec(&ServiceCall {
            entity_id: &self.entity_id,
        })
        .map_err(HaError::Json)?;

        self.build_request_builder(Method::POST, &path)?
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(HaError::Http)
    }

    fn build_request_builder(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, HaError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| HaError::Url(err.to_string()))?;
        let headers = self.common_headers()?;
        Ok(self.http.request(method, url).headers(headers))
    }

    fn common_headers(&self) -> Result<HeaderMap, HaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(HaError::InvalidHeaderValue)?,
        );
        Ok(headers)
    }
}

fn service_action(active: bool) -> &'static str {
    if active {
        "turn_on"
    } else {
        "turn_off"
    }
}

#[derive(Debug)]
pub enum HaError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    InvalidHeaderValue(reqwest::header::InvalidHeaderValue),
    Api { status: StatusCode, body: String },
}

impl fmt::Display for HaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::InvalidHeaderValue(err) => write!(f, "invalid header value: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
        }
    }
}

impl std::error::Error for HaError {}

#[derive(Debug, Serialize)]
struct ServiceCall<'a> {
    entity_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

pub fn parse_state_response(status: StatusCode, body: &str) -> Result<String, HaError> {
    if !status.is_success() {
        return Err(HaError::Api {
            status,
            body: body.to_string(),
        });
    }
    let resp: StateResponse = serde_json::from_str(body).map_err(HaError::Json)?;
    Ok(resp.state)
}

pub fn parse_set_state_response(status: StatusCode, body: &str) -> Result<(), HaError> {
    if !status.is_success() {
        return Err(HaError::Api {
            status,
            body: body.to_string(),
        });
    }
    Ok(())
}
