//! End-to-end pipeline tests: a stub driver task stands in for the browser,
//! feeding exchanges through the coordinator while the test plays operator.

use intercept_core::exchange::{PreparedRequest, PreparedResponse};
use intercept_core::{
    Coordinator, CoordinatorConfig, Decision, EngineEvent, ExchangeEdit, Headers, RawRequest,
    RawResponse, RequestVerdict, ResponseVerdict, RewriteRule, RewriteScope,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn coordinator() -> Arc<Coordinator> {
    Arc::new(Coordinator::new(CoordinatorConfig::default()))
}

fn get(url: &str) -> RawRequest {
    RawRequest {
        method: "GET".into(),
        url: url.into(),
        headers: Headers::from_pairs(vec![
            ("Host".into(), "a.test".into()),
            ("User-Agent".into(), "Mozilla/5.0".into()),
        ]),
        body: None,
        resource_type: "document".into(),
    }
}

fn rule(scope: RewriteScope, pattern: &str, replace: &str, is_regex: bool) -> RewriteRule {
    RewriteRule {
        enabled: true,
        scope,
        match_pattern: pattern.into(),
        replacement: replace.into(),
        is_regex,
        comment: String::new(),
    }
}

/// What the stub driver observed for one exchange.
#[derive(Debug)]
enum Observed {
    /// The request that went upstream and the response the browser received.
    Completed(PreparedRequest, Option<PreparedResponse>),
    /// The exchange was aborted.
    Dropped,
}

/// Drive one exchange through the coordinator the way the browser driver
/// does: release or await the request decision, then feed a canned upstream
/// response through the response hook.
async fn drive(
    coordinator: Arc<Coordinator>,
    raw: RawRequest,
    status: u16,
    response_body: &str,
) -> Observed {
    let prepared = match coordinator.on_request(raw) {
        RequestVerdict::Excluded => panic!("unexpected exclusion"),
        RequestVerdict::Release(prepared) => prepared,
        RequestVerdict::Suspend(mut prepared, decision) => match decision.await {
            Ok(Decision::Forward(edit)) => {
                if let Some(edit) = edit {
                    edit.apply_to_request(&mut prepared);
                }
                prepared
            }
            Ok(Decision::Drop) | Err(_) => return Observed::Dropped,
        },
    };

    let raw_response = RawResponse {
        url: prepared.url.clone(),
        status,
        headers: Headers::from_pairs(vec![("Content-Type".into(), "text/html".into())]),
        body: Some(response_body.to_string()),
    };
    match coordinator.on_response(&prepared.id, raw_response) {
        ResponseVerdict::Release(response) => Observed::Completed(prepared, Some(response)),
        ResponseVerdict::Suspend(mut response, decision) => match decision.await {
            Ok(Decision::Forward(edit)) => {
                if let Some(edit) = edit {
                    edit.apply_to_response(&mut response);
                }
                Observed::Completed(prepared, Some(response))
            }
            Ok(Decision::Drop) | Err(_) => Observed::Dropped,
        },
    }
}

/// Wait for the next prompt event and return the exchange id it refers to.
async fn next_prompt(events: &mut broadcast::Receiver<EngineEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for prompt")
            .expect("event stream closed");
        if let Some(id) = event.prompt_id() {
            return id.to_string();
        }
    }
}

#[tokio::test]
async fn plain_capture() {
    let c = coordinator();
    let mut events = c.subscribe();

    let observed = drive(c.clone(), get("https://a.test/x"), 200, "<html>").await;
    let Observed::Completed(request, Some(response)) = observed else {
        panic!("exchange did not complete");
    };
    assert_eq!(request.seq, 1);
    assert_eq!(response.status, 200);
    assert_eq!(c.suspended_count(), 0);

    match events.recv().await.unwrap() {
        EngineEvent::Request(capture) => {
            assert_eq!(capture.seq, 1);
            assert!(!capture.pending);
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.recv().await.unwrap() {
        EngineEvent::Response(capture) => {
            assert_eq!(capture.req_id, request.id);
            assert_eq!(capture.status, 200);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn edit_and_forward() {
    let c = coordinator();
    c.set_intercept_requests(true);
    c.operator_attached();
    let mut events = c.subscribe();

    let driver = tokio::spawn(drive(
        c.clone(),
        RawRequest {
            method: "POST".into(),
            url: "https://a.test/login".into(),
            headers: Headers::from_pairs(vec![("Content-Length".into(), "7".into())]),
            body: Some("u=a&p=b".into()),
            resource_type: "xhr".into(),
        },
        200,
        "welcome",
    ));

    let id = next_prompt(&mut events).await;
    assert!(c.forward(
        &id,
        Some(ExchangeEdit {
            body: Some("u=a&p=Xlonger".into()),
            ..Default::default()
        }),
        None,
    ));

    let Observed::Completed(request, Some(response)) = driver.await.unwrap() else {
        panic!("exchange did not complete");
    };
    // Upstream sees the edited body with a recomputed Content-Length; the
    // response reaches the browser unmodified.
    assert_eq!(request.body.as_deref(), Some("u=a&p=Xlonger"));
    assert_eq!(request.headers.get("content-length"), Some("13"));
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some("welcome"));
}

#[tokio::test]
async fn drop_marks_history() {
    let c = coordinator();
    c.set_intercept_requests(true);
    c.operator_attached();
    let mut events = c.subscribe();

    let driver = tokio::spawn(drive(c.clone(), get("https://a.test/track"), 200, ""));
    let id = next_prompt(&mut events).await;
    assert!(c.drop_exchange(&id));
    assert!(matches!(driver.await.unwrap(), Observed::Dropped));
    assert_eq!(c.suspended_count(), 0);

    // No capture_response is emitted, only the drop notification.
    loop {
        match events.recv().await.unwrap() {
            EngineEvent::Dropped { id: dropped } => {
                assert_eq!(dropped, id);
                break;
            }
            EngineEvent::Response(_) => panic!("dropped exchange produced a response event"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn response_interception_edits_status() {
    let c = coordinator();
    c.set_intercept_requests(true);
    c.operator_attached();
    let mut events = c.subscribe();

    let driver = tokio::spawn(drive(c.clone(), get("https://a.test/page"), 200, "fine"));

    let id = next_prompt(&mut events).await;
    assert!(c.forward(&id, None, Some(true)));

    // The response side suspends next; edit 200 -> 500.
    let response_id = next_prompt(&mut events).await;
    assert_eq!(response_id, id);
    assert!(c.forward(
        &id,
        Some(ExchangeEdit {
            status: Some(500),
            ..Default::default()
        }),
        None,
    ));

    let Observed::Completed(_, Some(response)) = driver.await.unwrap() else {
        panic!("exchange did not complete");
    };
    assert_eq!(response.status, 500);
    assert_eq!(response.body.as_deref(), Some("fine"));
}

#[tokio::test]
async fn header_rule_rewrites_all_traffic() {
    let c = coordinator();
    c.set_rules(vec![rule(
        RewriteScope::RequestHeader,
        "User-Agent: .*",
        "User-Agent: X",
        true,
    )]);

    let Observed::Completed(request, _) =
        drive(c.clone(), get("https://a.test/"), 200, "").await
    else {
        panic!("exchange did not complete");
    };
    assert_eq!(request.headers.get("user-agent"), Some("X"));
    assert_eq!(request.headers.len(), 2);
}

#[tokio::test]
async fn response_body_rules_compose() {
    let c = coordinator();
    c.set_rules(vec![
        rule(RewriteScope::ResponseBody, "foo", "bar", false),
        rule(RewriteScope::ResponseBody, "bar", "baz", false),
    ]);

    let Observed::Completed(_, Some(response)) =
        drive(c.clone(), get("https://a.test/"), 200, "foo").await
    else {
        panic!("exchange did not complete");
    };
    assert_eq!(response.body.as_deref(), Some("baz"));
}

#[tokio::test]
async fn responses_correlate_with_prior_requests() {
    let c = coordinator();
    let mut events = c.subscribe();

    for i in 0..10 {
        drive(
            c.clone(),
            get(&format!("https://a.test/{}", i)),
            200,
            "body",
        )
        .await;
    }

    let mut request_ids = HashSet::new();
    for _ in 0..20 {
        match events.recv().await.unwrap() {
            EngineEvent::Request(capture) => {
                request_ids.insert(capture.id);
            }
            EngineEvent::Response(capture) => {
                assert!(
                    request_ids.contains(&capture.req_id),
                    "response without a prior request capture"
                );
            }
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_every_suspended_exchange() {
    let c = coordinator();
    c.set_intercept_requests(true);
    c.operator_attached();

    let mut drivers = Vec::new();
    for i in 0..5 {
        drivers.push(tokio::spawn(drive(
            c.clone(),
            get(&format!("https://a.test/{}", i)),
            200,
            "ok",
        )));
    }
    // Let the driver tasks reach their suspension points.
    tokio::task::yield_now().await;
    assert_eq!(c.suspended_count(), 5);

    c.operator_detached();
    tokio::time::sleep(Duration::from_secs(6)).await;

    // Within grace + epsilon, upstream observes five completed requests.
    for driver in drivers {
        assert!(matches!(
            driver.await.unwrap(),
            Observed::Completed(_, Some(_))
        ));
    }
    assert!(!c.intercept_requests());
    assert_eq!(c.suspended_count(), 0);
}
