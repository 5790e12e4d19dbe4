//! CDP Fetch Interception Loop
//!
//! Arms the Fetch domain at both request and response stages and routes every
//! paused exchange through the interception coordinator. Operator decisions
//! come back through the resume token; the loop executes them with
//! `Fetch.continueRequest`, `Fetch.failRequest` and `Fetch.fulfillRequest`.

use crate::error::{BrowserEngineError, EngineResult};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
    FulfillRequestParams, GetResponseBodyParams, HeaderEntry, RequestId, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::Page;
use dashmap::DashMap;
use futures::StreamExt;
use intercept_core::exchange::{PreparedRequest, PreparedResponse};
use intercept_core::{
    Coordinator, Decision, Headers, RawRequest, RawResponse, RequestVerdict, ResponseVerdict,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Arm Fetch interception on the page and spawn the event loop.
pub async fn spawn(page: Page, coordinator: Arc<Coordinator>) -> EngineResult<JoinHandle<()>> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| BrowserEngineError::Cdp(e.to_string()))?;

    page.execute(
        EnableParams::builder()
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Request)
                    .build(),
            )
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Response)
                    .build(),
            )
            .build(),
    )
    .await
    .map_err(|e| BrowserEngineError::Cdp(e.to_string()))?;

    // Fetch request id -> exchange id, bridging the request and response
    // pause of the same exchange.
    let exchange_ids: Arc<DashMap<String, String>> = Arc::new(DashMap::new());

    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            // A suspended exchange blocks until the operator decides, so
            // every pause is handled on its own task.
            let page = page.clone();
            let coordinator = coordinator.clone();
            let exchange_ids = exchange_ids.clone();
            tokio::spawn(async move {
                handle_paused(page, coordinator, exchange_ids, event).await;
            });
        }
        debug!("Fetch event stream ended");
    }))
}

async fn handle_paused(
    page: Page,
    coordinator: Arc<Coordinator>,
    exchange_ids: Arc<DashMap<String, String>>,
    event: Arc<EventRequestPaused>,
) {
    let at_response_stage = event.response_status_code.is_some()
        || event.response_error_reason.is_some()
        || event.response_headers.is_some();
    if at_response_stage {
        handle_response_stage(page, coordinator, exchange_ids, event).await;
    } else {
        handle_request_stage(page, coordinator, exchange_ids, event).await;
    }
}

async fn handle_request_stage(
    page: Page,
    coordinator: Arc<Coordinator>,
    exchange_ids: Arc<DashMap<String, String>>,
    event: Arc<EventRequestPaused>,
) {
    let fetch_id = event.request_id.clone();
    let key = fetch_id.inner().clone();

    let raw = RawRequest {
        method: event.request.method.clone(),
        url: event.request.url.clone(),
        headers: cdp_request_headers(&event),
        body: event.request.post_data.clone(),
        resource_type: resource_type_label(&event),
    };

    match coordinator.on_request(raw) {
        RequestVerdict::Excluded => {
            continue_untouched(&page, fetch_id).await;
        }
        RequestVerdict::Release(prepared) => {
            exchange_ids.insert(key, prepared.id.clone());
            continue_request(&page, fetch_id, &event, &prepared).await;
        }
        RequestVerdict::Suspend(mut prepared, decision) => {
            exchange_ids.insert(key.clone(), prepared.id.clone());
            match decision.await {
                Ok(Decision::Forward(edit)) => {
                    if let Some(edit) = edit {
                        edit.apply_to_request(&mut prepared);
                    }
                    continue_request(&page, fetch_id, &event, &prepared).await;
                }
                Ok(Decision::Drop) => {
                    exchange_ids.remove(&key);
                    abort_request(&page, fetch_id).await;
                }
                // Coordinator went away without a decision; release the
                // browser rather than hanging the page.
                Err(_) => {
                    exchange_ids.remove(&key);
                    continue_untouched(&page, fetch_id).await;
                }
            }
        }
    }
}

async fn handle_response_stage(
    page: Page,
    coordinator: Arc<Coordinator>,
    exchange_ids: Arc<DashMap<String, String>>,
    event: Arc<EventRequestPaused>,
) {
    let fetch_id = event.request_id.clone();
    let key = fetch_id.inner().clone();

    // Excluded and untracked exchanges pass through untouched.
    let Some((_, exchange_id)) = exchange_ids.remove(&key) else {
        continue_untouched(&page, fetch_id).await;
        return;
    };

    if let Some(reason) = &event.response_error_reason {
        coordinator.on_request_failed(&exchange_id, &event.request.url, format!("{:?}", reason));
        continue_untouched(&page, fetch_id).await;
        return;
    }

    let body = fetch_response_body(&page, &fetch_id).await;
    let raw = RawResponse {
        url: event.request.url.clone(),
        status: event.response_status_code.unwrap_or(0) as u16,
        headers: cdp_response_headers(&event),
        body,
    };

    match coordinator.on_response(&exchange_id, raw) {
        ResponseVerdict::Release(prepared) => {
            fulfill_response(&page, fetch_id, &prepared).await;
        }
        ResponseVerdict::Suspend(mut prepared, decision) => match decision.await {
            Ok(Decision::Forward(edit)) => {
                if let Some(edit) = edit {
                    edit.apply_to_response(&mut prepared);
                }
                fulfill_response(&page, fetch_id, &prepared).await;
            }
            Ok(Decision::Drop) => {
                abort_request(&page, fetch_id).await;
            }
            Err(_) => {
                fulfill_response(&page, fetch_id, &prepared).await;
            }
        },
    }
}

/// Release a paused request with the prepared (rewritten or edited) content.
async fn continue_request(
    page: &Page,
    fetch_id: RequestId,
    event: &EventRequestPaused,
    prepared: &PreparedRequest,
) {
    let mut builder = ContinueRequestParams::builder().request_id(fetch_id.clone());
    if prepared.url != event.request.url {
        builder = builder.url(prepared.url.clone());
    }
    if prepared.method != event.request.method {
        builder = builder.method(prepared.method.clone());
    }
    for entry in header_entries(&prepared.headers) {
        builder = builder.header(entry);
    }
    if let Some(body) = &prepared.body {
        builder = builder.post_data(body.clone());
    }
    match builder.build() {
        Ok(params) => {
            if let Err(e) = page.execute(params).await {
                warn!("continueRequest failed: {}", e);
                continue_untouched(page, fetch_id).await;
            }
        }
        Err(e) => warn!("continueRequest build failed: {}", e),
    }
}

/// Release a paused request with no modifications at all.
async fn continue_untouched(page: &Page, fetch_id: RequestId) {
    if let Err(e) = page.execute(ContinueRequestParams::new(fetch_id)).await {
        debug!("continueRequest (untouched) failed: {}", e);
    }
}

async fn abort_request(page: &Page, fetch_id: RequestId) {
    if let Err(e) = page
        .execute(FailRequestParams::new(fetch_id, ErrorReason::Aborted))
        .await
    {
        warn!("failRequest failed: {}", e);
    }
}

/// Deliver a prepared response to the browser.
async fn fulfill_response(page: &Page, fetch_id: RequestId, prepared: &PreparedResponse) {
    let mut builder = FulfillRequestParams::builder()
        .request_id(fetch_id.clone())
        .response_code(prepared.status as i64);
    for entry in header_entries(&prepared.headers) {
        builder = builder.response_header(entry);
    }
    if let Some(body) = &prepared.body {
        builder = builder.body(body.clone());
    }
    match builder.build() {
        Ok(params) => {
            if let Err(e) = page.execute(params).await {
                warn!("fulfillRequest failed: {}", e);
                continue_untouched(page, fetch_id).await;
            }
        }
        Err(e) => warn!("fulfillRequest build failed: {}", e),
    }
}

/// Body of a response paused at the Response stage. Some pauses (redirects,
/// empty bodies) legitimately have none.
async fn fetch_response_body(page: &Page, fetch_id: &RequestId) -> Option<String> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let response = page
        .execute(GetResponseBodyParams::new(fetch_id.clone()))
        .await
        .ok()?;
    if response.base64_encoded {
        let bytes = STANDARD.decode(&response.body).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Some(response.body.clone())
    }
}

fn header_entries(headers: &Headers) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn cdp_request_headers(event: &EventRequestPaused) -> Headers {
    match serde_json::to_value(&event.request.headers) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect(),
        _ => Headers::new(),
    }
}

fn cdp_response_headers(event: &EventRequestPaused) -> Headers {
    event
        .response_headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|entry| (entry.name.clone(), entry.value.clone()))
        .collect()
}

fn resource_type_label(event: &EventRequestPaused) -> String {
    match serde_json::to_value(&event.resource_type) {
        Ok(serde_json::Value::String(label)) => label,
        _ => String::new(),
    }
}
