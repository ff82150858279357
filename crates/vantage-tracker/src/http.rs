use crate::delivery::{BeaconSink, FetchRequest, HttpFetch, TransportError};
use crate::tracker::RuleSource;
use reqwest::blocking::Client;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use vantage_core::contracts::{ContentRule, RulesResponse};
use vantage_core::AttributionParameters;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const BEACON_ACK_TIMEOUT: Duration = Duration::from_secs(3);

fn build_client() -> Result<Client, TransportError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|err| TransportError::Unavailable(err.to_string()))
}

/// Keep-alive POSTs through reqwest. No cookie store is configured, so requests never carry
/// credentials.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
        })
    }
}

impl HttpFetch for ReqwestFetch {
    fn post(&self, request: &FetchRequest<'_>) -> Result<u16, TransportError> {
        let connection = if request.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        let response = self
            .client
            .post(request.url)
            .header(CONTENT_TYPE, request.content_type)
            .header(CONNECTION, connection)
            .body(request.body.to_string())
            .send()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Beacon-style sender. The POST runs on a detached thread so it finishes even if the
/// caller goes away, while the caller waits up to the ack timeout for the outcome. Only a
/// 2xx answer counts as sent; errors, other statuses and unconfirmed sends report `false`
/// and the payload is queued for retry.
#[derive(Debug, Clone)]
pub struct ThreadBeacon {
    client: Client,
    ack_timeout: Duration,
}

impl ThreadBeacon {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
            ack_timeout: BEACON_ACK_TIMEOUT,
        })
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }
}

impl BeaconSink for ThreadBeacon {
    fn send_beacon(&self, url: &str, body: &str) -> bool {
        let (done, outcome) = mpsc::channel();
        let client = self.client.clone();
        let url = url.to_string();
        let body = body.to_string();
        let spawned = thread::Builder::new()
            .name("vantage-beacon".to_string())
            .spawn(move || {
                let delivered = match client
                    .post(&url)
                    .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
                    .body(body)
                    .send()
                {
                    Ok(response) if response.status().is_success() => true,
                    Ok(response) => {
                        debug!(
                            event = "beacon_rejected",
                            url = %url,
                            status = response.status().as_u16()
                        );
                        false
                    }
                    Err(err) => {
                        debug!(event = "beacon_failed", url = %url, error = %err);
                        false
                    }
                };
                let _ = done.send(delivered);
            });
        if let Err(err) = spawned {
            debug!(event = "beacon_spawn_failed", error = %err);
            return false;
        }

        match outcome.recv_timeout(self.ack_timeout) {
            Ok(delivered) => delivered,
            Err(_) => {
                debug!(
                    event = "beacon_unconfirmed",
                    timeout_ms = self.ack_timeout.as_millis() as u64
                );
                false
            }
        }
    }
}

/// Fetches rules from the hub's `GET /rules` endpoint.
#[derive(Debug, Clone)]
pub struct HttpRuleSource {
    client: Client,
    endpoint: String,
}

impl HttpRuleSource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client()?,
            endpoint: endpoint.into(),
        })
    }
}

impl RuleSource for HttpRuleSource {
    fn fetch_rules(
        &self,
        attribution: &AttributionParameters,
    ) -> Result<Vec<ContentRule>, TransportError> {
        let query: Vec<(&str, &str)> = attribution
            .present()
            .map(|(field, value)| (field.as_str(), value))
            .collect();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        let body: RulesResponse = response
            .json()
            .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
        Ok(body.rules)
    }
}
