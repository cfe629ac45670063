use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::{Backend, EventStream};
use crate::error::BackendError;
use crate::models::courier::CourierStatus;
use crate::models::order::{DeliveryOrder, Evidence, OrderChanged};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Backend reached over HTTP. Order events arrive as newline-delimited JSON
/// on a long-lived response body.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    raw_status: &'a str,
}

#[derive(Serialize)]
struct AvailabilityBody {
    status: CourierStatus,
}

#[derive(serde::Deserialize)]
struct ProofResponse {
    reference: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BackendError::ConnectionLost(format!("http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|err| BackendError::ConnectionLost(err.to_string()))
    }
}

async fn check(response: Response, order_id: Option<Uuid>) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        if let Some(order_id) = order_id {
            return Err(BackendError::NotFound(order_id));
        }
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(BackendError::Rejected(format!("{status}: {body}")))
    } else {
        Err(BackendError::ConnectionLost(format!("{status}: {body}")))
    }
}

/// Pops every complete line out of `buffer`, decoding each non-blank one.
/// A trailing partial line stays in the buffer.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Result<OrderChanged, BackendError>> {
    let mut events = Vec::new();
    while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        events.push(
            serde_json::from_str::<OrderChanged>(line)
                .map_err(|err| BackendError::Decode(err.to_string())),
        );
    }
    events
}

#[async_trait]
impl Backend for HttpBackend {
    async fn subscribe(&self, order_id: Uuid) -> Result<EventStream, BackendError> {
        let request = self
            .client
            .get(self.url(&format!("/orders/{order_id}/events")))
            .header("accept", "application/x-ndjson");
        let response = check(self.send(request).await?, Some(order_id)).await?;

        let bytes = Box::pin(response.bytes_stream());
        let stream = futures::stream::unfold(
            (bytes, Vec::new(), Vec::new().into_iter()),
            |(mut bytes, mut buffer, mut ready)| async move {
                loop {
                    if let Some(event) = ready.next() {
                        return Some((event, (bytes, buffer, ready)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            ready = drain_lines(&mut buffer).into_iter();
                        }
                        Some(Err(err)) => {
                            let lost = Err(BackendError::ConnectionLost(err.to_string()));
                            return Some((lost, (bytes, buffer, ready)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn get_order(&self, order_id: Uuid) -> Result<DeliveryOrder, BackendError> {
        let request = self
            .client
            .get(self.url(&format!("/orders/{order_id}")))
            .timeout(REQUEST_TIMEOUT);
        let response = check(self.send(request).await?, Some(order_id)).await?;

        response
            .json::<DeliveryOrder>()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn set_order_status(
        &self,
        order_id: Uuid,
        raw_status: &str,
    ) -> Result<(), BackendError> {
        let request = self
            .client
            .patch(self.url(&format!("/orders/{order_id}/status")))
            .timeout(REQUEST_TIMEOUT)
            .json(&StatusBody { raw_status });
        check(self.send(request).await?, Some(order_id)).await?;
        Ok(())
    }

    async fn upload_proof(
        &self,
        order_id: Uuid,
        evidence: &Evidence,
    ) -> Result<String, BackendError> {
        let request = self
            .client
            .post(self.url(&format!("/orders/{order_id}/proof")))
            .timeout(REQUEST_TIMEOUT)
            .json(evidence);
        let response = check(self.send(request).await?, Some(order_id)).await?;

        response
            .json::<ProofResponse>()
            .await
            .map(|body| body.reference)
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        status: CourierStatus,
    ) -> Result<(), BackendError> {
        let request = self
            .client
            .put(self.url(&format!("/couriers/{courier_id}/availability")))
            .timeout(REQUEST_TIMEOUT)
            .json(&AvailabilityBody { status });
        check(self.send(request).await?, None).await?;
        Ok(())
    }

    async fn active_order(&self, courier_id: Uuid) -> Result<Option<DeliveryOrder>, BackendError> {
        let request = self
            .client
            .get(self.url(&format!("/couriers/{courier_id}/active-order")))
            .timeout(REQUEST_TIMEOUT);
        let response = self.send(request).await?;

        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT
        ) {
            return Ok(None);
        }

        check(response, None)
            .await?
            .json::<DeliveryOrder>()
            .await
            .map(Some)
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}
