mod common;

use ai_gencache::cache::{document_id, CacheConfig, CacheType, DocumentStore, MemoryStore};
use ai_gencache::clock::ManualClock;
use ai_gencache::extract::ExpectedShape;
use ai_gencache::orchestrator::{Stage, StageGraph};
use ai_gencache::resilience::{QuotaConfig, RetryPolicy};
use ai_gencache::telemetry::{GenerationEvent, InMemoryEventSink};
use ai_gencache::{fingerprint, CacheFirstOrchestrator, Error, GenCacheConfig, GenerationRequest};
use common::{init_tracing, BrokenStore, ScriptedUpstream};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: CacheFirstOrchestrator,
    upstream: Arc<ScriptedUpstream>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    events: Arc<InMemoryEventSink>,
}

fn harness_with(upstream: ScriptedUpstream, config: GenCacheConfig) -> Harness {
    init_tracing();
    let upstream = Arc::new(upstream);
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let events = Arc::new(InMemoryEventSink::default());
    let orchestrator = CacheFirstOrchestrator::builder()
        .with_config(config)
        .with_store(store.clone())
        .with_clock(clock.clone())
        .with_event_sink(events.clone())
        .build(upstream.clone())
        .unwrap();
    Harness {
        orchestrator,
        upstream,
        store,
        clock,
        events,
    }
}

fn harness(reply: &str) -> Harness {
    harness_with(ScriptedUpstream::new(reply), GenCacheConfig::default())
}

fn summary_request() -> GenerationRequest {
    GenerationRequest::new("summary-S1", CacheType::Summary, json!({"studentId": "S1"}))
}

fn summary_shape() -> ExpectedShape {
    ExpectedShape::object("summary")
}

#[tokio::test]
async fn test_cold_cache_generates_and_stores_once() {
    let h = harness("{\"summary\": \"steady progress\"}");
    let resolved = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |r| {
            format!("Summarise {}", r.semantic_input)
        })
        .await
        .unwrap();

    assert!(!resolved.cached);
    assert!(!resolved.degraded);
    assert_eq!(resolved.output["summary"], "steady progress");
    assert_eq!(h.upstream.calls(), 1);
    assert!(h.upstream.prompts()[0].contains("S1"));

    let hash = fingerprint(&json!({"studentId": "S1"})).unwrap();
    let doc = h
        .store
        .get("generation_cache", &document_id("summary-S1", &hash))
        .await
        .unwrap()
        .expect("entry stored under (cache_key, input_hash)");
    assert_eq!(doc["cache_key"], "summary-S1");
    assert_eq!(doc["cache_type"], "summary");
    assert_eq!(doc["hit_count"], 0);

    let stats = h.orchestrator.stats().await.unwrap();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.by_type["summary"].entries, 1);
}

#[tokio::test]
async fn test_second_resolve_is_served_from_cache() {
    let h = harness("{\"summary\": \"steady progress\"}");
    let first = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".to_string())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| {
            panic!("prompt must not be built on a hit")
        })
        .await
        .unwrap();

    assert_eq!(h.upstream.calls(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.output, second.output);
    assert_eq!(second.attempts, 0);

    let stats = h.orchestrator.stats().await.unwrap();
    assert_eq!(stats.total_hits, 1);
    assert_eq!(h.orchestrator.metrics().cache_hits, 1);
    assert_eq!(h.orchestrator.metrics().cache_misses, 1);
}

#[tokio::test]
async fn test_key_order_does_not_change_identity() {
    let h = harness("{\"summary\": \"x\"}");
    let a = GenerationRequest::new("summary-S1", CacheType::Summary, json!({"a": 1, "b": [1, 2]}));
    let b = GenerationRequest::new("summary-S1", CacheType::Summary, json!({"b": [1, 2], "a": 1}));
    h.orchestrator
        .resolve(&a, &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    let again = h
        .orchestrator
        .resolve(&b, &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(again.cached);
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn test_invalidation_forces_regeneration() {
    let h = harness("{\"summary\": \"steady progress\"}");
    h.orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();

    let other = GenerationRequest::new("summary-S1", CacheType::Summary, json!({"studentId": "S1", "term": 2}));
    h.orchestrator
        .resolve(&other, &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert_eq!(h.upstream.calls(), 2);

    // Every input hash under the key goes.
    assert_eq!(h.orchestrator.invalidate("summary-S1").await.unwrap(), 2);
    assert_eq!(h.orchestrator.stats().await.unwrap().total_entries, 0);

    let again = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(!again.cached);
    assert_eq!(h.upstream.calls(), 3);
}

#[tokio::test]
async fn test_invalidate_type_leaves_other_types() {
    let h = harness("{\"v\": 1}");
    let score = GenerationRequest::new("score-R1", CacheType::Score, json!({"resume": "R1"}));
    h.orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    h.orchestrator
        .resolve(&score, &ExpectedShape::object("score"), |_| "p".into())
        .await
        .unwrap();

    assert_eq!(
        h.orchestrator.invalidate_type(&CacheType::Score).await.unwrap(),
        1
    );
    let stats = h.orchestrator.stats().await.unwrap();
    assert_eq!(stats.total_entries, 1);
    assert!(stats.by_type.contains_key("summary"));
}

fn study_graph() -> StageGraph {
    let concepts = Stage::new(
        "concepts",
        GenerationRequest::new(
            "concepts-algo-ch3",
            CacheType::Concepts,
            json!({"subject": "algorithms", "chapter": 3}),
        ),
        ExpectedShape::object("concepts"),
        |req, _| format!("List the concepts of {}", req.semantic_input),
    );
    let notes = Stage::new(
        "notes",
        GenerationRequest::new(
            "notes-algo-ch3",
            CacheType::Notes,
            json!({"subject": "algorithms", "chapter": 3, "style": "brief"}),
        ),
        ExpectedShape::object("notes").with_long_text_field("content"),
        |_, deps| format!("Write notes covering {}", deps.output("concepts")["concepts"]),
    )
    .depends_on("concepts");
    StageGraph::builder()
        .stage(notes)
        .stage(concepts)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_multi_stage_chain_resolves_dependency_first() {
    let upstream = ScriptedUpstream::new("unused")
        .then_ok("{\"concepts\": [\"graphs\", \"heaps\"]}")
        .then_ok("{\"title\": \"Ch3\", \"content\": \"line one\nline two\"}");
    let h = harness_with(upstream, GenCacheConfig::default());
    let graph = study_graph();

    let notes = h.orchestrator.resolve_stage(&graph, "notes").await.unwrap();
    assert!(!notes.cached);
    assert_eq!(notes.output["content"], "line one\nline two");

    let prompts = h.upstream.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].starts_with("List the concepts"));
    assert!(prompts[1].contains("graphs"));

    let stored: Vec<String> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            GenerationEvent::Stored { cache_key, .. } => Some(cache_key),
            _ => None,
        })
        .collect();
    assert_eq!(stored, vec!["concepts-algo-ch3", "notes-algo-ch3"]);

    let again = h.orchestrator.resolve_stage(&graph, "notes").await.unwrap();
    assert!(again.cached);
    assert_eq!(h.upstream.calls(), 2);
}

#[tokio::test]
async fn test_cached_stage_does_not_touch_dependencies() {
    let upstream = ScriptedUpstream::new("unused")
        .then_ok("{\"concepts\": [\"graphs\"]}")
        .then_ok("{\"content\": \"notes\"}")
        .then_ok("{\"concepts\": [\"trees\"]}");
    let h = harness_with(upstream, GenCacheConfig::default());
    let graph = study_graph();
    h.orchestrator.resolve_stage(&graph, "notes").await.unwrap();

    // The dependency can be invalidated without affecting a cached dependent.
    h.orchestrator.invalidate("concepts-algo-ch3").await.unwrap();
    h.events.clear();
    let notes = h.orchestrator.resolve_stage(&graph, "notes").await.unwrap();
    assert!(notes.cached);
    assert_eq!(h.upstream.calls(), 2);
    assert_eq!(h.events.kinds(), vec!["cache_hit"]);

    let all = h.orchestrator.resolve_all(&graph).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(!all.get("concepts").unwrap().cached);
    assert_eq!(h.upstream.calls(), 3);
}

#[tokio::test]
async fn test_sub_second_expiry_is_a_miss() {
    let h = harness("{\"summary\": \"x\"}");
    let request = summary_request().with_expiry_days(0.0000001);
    h.orchestrator
        .resolve(&request, &summary_shape(), |_| "p".into())
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(1));
    let again = h
        .orchestrator
        .resolve(&request, &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(!again.cached);
    assert_eq!(h.upstream.calls(), 2);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.orchestrator.sweep_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn test_default_expiry_from_config() {
    let config = GenCacheConfig::default()
        .with_cache(CacheConfig::default().with_default_expiry_days(1.0));
    let h = harness_with(ScriptedUpstream::new("{\"summary\": \"x\"}"), config);
    h.orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(23 * 3600));
    let hit = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(hit.cached);

    h.clock.advance(Duration::from_secs(2 * 3600));
    let miss = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(!miss.cached);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_generation() {
    let upstream = ScriptedUpstream::new("{\"summary\": \"shared\"}")
        .with_delay(Duration::from_millis(200));
    let h = harness_with(upstream, GenCacheConfig::default());
    let request = summary_request();
    let shape = summary_shape();

    let (a, b, c) = tokio::join!(
        h.orchestrator.resolve(&request, &shape, |_| "p".into()),
        h.orchestrator.resolve(&request, &shape, |_| "p".into()),
        h.orchestrator.resolve(&request, &shape, |_| "p".into()),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a.output, b.output);
    assert_eq!(b.output, c.output);
    assert_eq!(h.upstream.calls(), 1);
    assert_eq!(h.orchestrator.metrics().coalesced, 2);
    assert_eq!(h.orchestrator.quota_info().minute_remaining, 11);
}

#[tokio::test(start_paused = true)]
async fn test_without_coalescing_each_miss_dispatches() {
    let upstream = ScriptedUpstream::new("{\"summary\": \"dup\"}")
        .with_delay(Duration::from_millis(200));
    let h = harness_with(
        upstream,
        GenCacheConfig::default().with_coalesce_misses(false),
    );
    let request = summary_request();
    let shape = summary_shape();
    let (a, b) = tokio::join!(
        h.orchestrator.resolve(&request, &shape, |_| "p".into()),
        h.orchestrator.resolve(&request, &shape, |_| "p".into()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.upstream.calls(), 2);
    // Last writer wins; still one entry.
    assert_eq!(h.orchestrator.stats().await.unwrap().total_entries, 1);
}

#[tokio::test]
async fn test_abandoned_resolve_still_caches_result() {
    let (upstream, release) = ScriptedUpstream::new("{\"summary\": \"late\"}").held();
    let h = harness_with(upstream, GenCacheConfig::default());

    let orchestrator = h.orchestrator.clone();
    let caller = tokio::spawn(async move {
        orchestrator
            .resolve(&summary_request(), &summary_shape(), |_| "p".into())
            .await
    });
    while h.upstream.calls() == 0 {
        tokio::task::yield_now().await;
    }
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    release.add_permits(1);
    let mut stored = false;
    for _ in 0..200 {
        if h.orchestrator.stats().await.unwrap().total_entries == 1 {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(stored, "result of the abandoned call was not cached");

    let hit = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(hit.cached);
    assert_eq!(hit.output["summary"], "late");
    assert_eq!(h.upstream.calls(), 1);
}

#[tokio::test]
async fn test_persistence_failures_are_transparent() {
    init_tracing();
    let upstream = ScriptedUpstream::constant("{\"summary\": \"fresh\"}");
    let orchestrator = CacheFirstOrchestrator::builder()
        .with_store(Arc::new(BrokenStore))
        .with_clock(Arc::new(ManualClock::starting_now()))
        .build(upstream.clone())
        .unwrap();

    for _ in 0..2 {
        let r = orchestrator
            .resolve(&summary_request(), &summary_shape(), |_| "p".into())
            .await
            .unwrap();
        assert!(!r.cached);
        assert_eq!(r.output["summary"], "fresh");
    }
    assert_eq!(upstream.calls(), 2);
    assert_eq!(orchestrator.metrics().stores, 0);

    // Maintenance operations do report the failure.
    assert!(matches!(
        orchestrator.invalidate("summary-S1").await,
        Err(Error::Persistence { .. })
    ));
    assert!(orchestrator.stats().await.is_err());
}

#[tokio::test]
async fn test_degraded_result_is_not_cached() {
    let config = GenCacheConfig::default()
        .with_retry(RetryPolicy::new().with_max_attempts(2));
    let h = harness_with(ScriptedUpstream::new("I cannot produce JSON today."), config);
    let shape = ExpectedShape::object("document").with_fallback(json!({"sections": []}));

    let r = h
        .orchestrator
        .resolve(&summary_request(), &shape, |_| "p".into())
        .await
        .unwrap();
    assert!(r.degraded);
    assert!(!r.cached);
    assert_eq!(r.output, json!({"sections": []}));
    assert_eq!(h.upstream.calls(), 2);
    assert_eq!(h.orchestrator.stats().await.unwrap().total_entries, 0);
    assert_eq!(h.orchestrator.metrics().degraded, 1);
    assert!(h.events.kinds().contains(&"parse_degraded"));
}

#[tokio::test]
async fn test_quota_exhaustion_surfaces_but_hits_still_served() {
    let config = GenCacheConfig::default().with_quota(QuotaConfig::new().with_per_minute(1));
    let h = harness_with(ScriptedUpstream::new("{\"v\": 1}"), config);

    h.orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();

    let other = GenerationRequest::new("summary-S2", CacheType::Summary, json!({"studentId": "S2"}));
    let err = h
        .orchestrator
        .resolve(&other, &summary_shape(), |_| "p".into())
        .await
        .unwrap_err();
    match err {
        Error::QuotaExceeded { retry_after_ms } => {
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000)
        }
        other => panic!("expected quota error, got {other:?}"),
    }
    assert_eq!(h.upstream.calls(), 1);

    let hit = h
        .orchestrator
        .resolve(&summary_request(), &summary_shape(), |_| "p".into())
        .await
        .unwrap();
    assert!(hit.cached);

    let info = h.orchestrator.quota_info();
    assert_eq!(info.minute_remaining, 0);
    assert!(info.reset_in_seconds <= 60);

    h.clock.advance(Duration::from_secs(60));
    assert!(h
        .orchestrator
        .resolve(&other, &summary_shape(), |_| "p".into())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_typed_parse_and_response_format_hint() {
    #[derive(serde::Deserialize, schemars::JsonSchema)]
    struct Score {
        score: u32,
        verdict: String,
    }

    let h = harness("Here you go: {\"score\": 81, \"verdict\": \"strong\"}");
    let shape = ExpectedShape::of::<Score>().unwrap();
    let request = GenerationRequest::new("score-R1", CacheType::Score, json!({"resume": "R1"}));
    let r = h
        .orchestrator
        .resolve(&request, &shape, |_| "p".into())
        .await
        .unwrap();
    let score: Score = r.parse().unwrap();
    assert_eq!(score.score, 81);
    assert_eq!(score.verdict, "strong");
    assert_eq!(h.upstream.formats()[0].as_str(), "json_schema");
}
