use console::{Project, ProjectStore, RepeaterTab};
use intercept_core::{
    Exchange, ExchangeState, ExclusionRule, Headers, ResponseRecord, RewriteRule, RewriteScope,
};
use tempfile::tempdir;

fn sample_project() -> Project {
    let mut project = Project::new("sample");
    project.target_url = "https://a.test".into();
    project.history_filter = "login".into();
    project.hide_static = true;
    project.requests.push(Exchange {
        id: "x-1".into(),
        seq: 1,
        method: "POST".into(),
        url: "https://a.test/login".into(),
        headers: Headers::from_pairs(vec![("Content-Type".into(), "text/plain".into())]),
        body: Some("u=a&p=b".into()),
        resource_type: "xhr".into(),
        timestamp: 1_700_000_000_000,
        response: Some(ResponseRecord {
            status: 200,
            headers: Headers::new(),
            body: Some("welcome".into()),
            error: None,
        }),
        state: ExchangeState::Completed,
        dropped: false,
        intercept_response: false,
    });
    project.exclusion_rules = vec![ExclusionRule::Domain("cdn.test".into())];
    project.match_replace_rules = vec![RewriteRule {
        enabled: true,
        scope: RewriteScope::RequestHeader,
        match_pattern: "User-Agent: .*".into(),
        replacement: "User-Agent: X".into(),
        is_regex: true,
        comment: "hide the automation UA".into(),
    }];
    project.repeater_tabs = vec![RepeaterTab {
        id: "tab-1".into(),
        name: "login".into(),
        request: "POST /login HTTP/1.1\nHost: a.test\n\nu=a&p=b".into(),
        response: String::new(),
        extra: Default::default(),
    }];
    project
}

#[tokio::test]
async fn save_then_load_round_trips() {
    let dir = tempdir().unwrap();
    let store = ProjectStore::new(dir.path());

    let mut project = sample_project();
    store.save(&mut project).await.unwrap();
    let loaded = store.load("sample").await.unwrap().unwrap();

    // Deep-equal modulo lastModified, which save bumps.
    let mut original = project.clone();
    original.last_modified.clear();
    let mut reloaded = loaded;
    reloaded.last_modified.clear();
    assert_eq!(original, reloaded);
}

#[tokio::test]
async fn unknown_fields_survive_round_trip() {
    let dir = tempdir().unwrap();
    let store = ProjectStore::new(dir.path());

    let document = serde_json::json!({
        "name": "forward",
        "created": "2026-01-01T00:00:00Z",
        "lastModified": "2026-01-01T00:00:00Z",
        "requests": [],
        "futureFeatureConfig": { "mode": "aggressive" }
    });
    std::fs::write(
        dir.path().join("forward.json"),
        serde_json::to_string(&document).unwrap(),
    )
    .unwrap();

    let mut project = store.load("forward").await.unwrap().unwrap();
    assert_eq!(
        project.extra["futureFeatureConfig"]["mode"],
        serde_json::json!("aggressive")
    );
    store.save(&mut project).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("forward.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["futureFeatureConfig"]["mode"], "aggressive");
}

#[tokio::test]
async fn list_is_sorted_and_counts_requests() {
    let dir = tempdir().unwrap();
    let store = ProjectStore::new(dir.path());

    let mut older = sample_project();
    older.name = "older".into();
    store.save(&mut older).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let mut newer = Project::new("newer");
    store.save(&mut newer).await.unwrap();

    let summaries = store.list().await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].name, "newer");
    assert_eq!(summaries[1].name, "older");
    assert_eq!(summaries[1].request_count, 1);
}

#[tokio::test]
async fn delete_removes_document() {
    let dir = tempdir().unwrap();
    let store = ProjectStore::new(dir.path());

    store.create("doomed").await.unwrap();
    assert!(store.delete("doomed").await.unwrap());
    assert!(!store.delete("doomed").await.unwrap());
    assert!(store.load("doomed").await.unwrap().is_none());
}

#[tokio::test]
async fn project_names_are_sanitised() {
    let dir = tempdir().unwrap();
    let store = ProjectStore::new(dir.path());

    store.create("../../etc/passwd").await.unwrap();
    // The traversal characters are stripped; the document stays in the root.
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["etcpasswd.json"]);
}
