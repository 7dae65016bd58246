//! Integration tests for deferred, cached field resolution.

use async_trait::async_trait;
use fieldwork_core::{CacheableMetadata, ConfigError, MaxAge, ResolveResult};
use fieldwork_runtime::{
    CacheBackend, Context, DataProducer, DataProducerProxy, Entity, EntityBuffer, EntityId,
    EntityLoad, Executor, ExecutorConfig, FieldInfo, ManualClock, MemoryCacheBackend,
    MemoryEntityStorage, PlanNode, ProducerDefinition, ProducerInputs, ProducerRegistry, QueryPlan,
    ResolveContext, Resolver, ResolverMap, Response, SchemaConfig, Services, SlotDefinition,
    SlotKind,
};
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONFIG: &str = r#"{
    "resolvers": {
        "Query.node": {
            "produce": "entity_load",
            "map": {"type": {"value": "node"}, "id": {"argument": "id"}},
            "cached": true
        },
        "Query.nodes": {
            "produce": "entity_load_multiple",
            "map": {"type": {"value": "node"}, "ids": {"argument": "ids"}}
        },
        "Node.label": {"produce": "entity_label", "map": {"entity": "parent"}},
        "Query.stamp": {
            "produce": "stamp",
            "map": {"label": {"argument": "label"}},
            "cached": true
        },
        "Query.fresh": {
            "produce": "stamp",
            "map": {"label": {"argument": "label"}},
            "config": {"max_age": 0},
            "cached": true
        },
        "Query.hourly": {
            "produce": "stamp",
            "map": {"label": {"argument": "label"}},
            "config": {"max_age": 3600},
            "cached": true
        }
    }
}"#;

/// Stamps a label with the interface language, counting invocations.
struct Stamp {
    calls: Arc<AtomicUsize>,
    max_age: MaxAge,
}

#[async_trait]
impl DataProducer for Stamp {
    async fn resolve(
        &self,
        inputs: &ProducerInputs,
        ctx: &ResolveContext,
        metadata: &mut CacheableMetadata,
    ) -> ResolveResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        metadata.merge_max_age(self.max_age);
        let label = inputs.require_str("stamp", "label")?;
        let language = ctx
            .request()
            .data
            .get("languages")
            .and_then(|languages| languages.get("language_interface"))
            .and_then(Value::as_str)
            .unwrap_or("und");
        Ok(json!(format!("{}:{}", label, language)))
    }

    fn cache_contexts(&self) -> Vec<String> {
        vec!["languages:language_interface".to_string()]
    }
}

struct Fixture {
    executor: Executor,
    storage: Arc<MemoryEntityStorage>,
    cache: Arc<MemoryCacheBackend>,
    clock: Arc<ManualClock>,
    stamps: Arc<AtomicUsize>,
}

fn nodes() -> MemoryEntityStorage {
    MemoryEntityStorage::from_entities([
        Entity::new("node", 1, "One"),
        Entity::new("node", 2, "Two"),
        Entity::new("node", 3, "Three"),
    ])
}

fn fixture(caching: bool) -> Fixture {
    fixture_with(nodes(), caching)
}

fn fixture_with(storage: MemoryEntityStorage, caching: bool) -> Fixture {
    let storage = Arc::new(storage);
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = Arc::new(MemoryCacheBackend::with_clock(clock.clone()));
    let stamps = Arc::new(AtomicUsize::new(0));

    let mut registry = ProducerRegistry::with_builtins(storage.clone());
    let counter = Arc::clone(&stamps);
    registry
        .register(
            ProducerDefinition::new("stamp", "Stamp")
                .consumes("label", SlotDefinition::required(SlotKind::String))
                .cacheable(),
            move |config: &Value| -> Result<Box<dyn DataProducer>, ConfigError> {
                let max_age = config
                    .get("max_age")
                    .and_then(Value::as_u64)
                    .map_or(MaxAge::Permanent, MaxAge::Seconds);
                Ok(Box::new(Stamp {
                    calls: Arc::clone(&counter),
                    max_age,
                }))
            },
        )
        .unwrap();

    let services = Services::new(registry)
        .with_cache(cache.clone())
        .with_clock(clock.clone());
    let config = SchemaConfig::from_json(CONFIG).unwrap();
    let (resolvers, diagnostics) = config.build(services.producers());
    assert!(diagnostics.is_empty(), "{:?}", diagnostics);

    let executor = Executor::new(resolvers, services).with_config(ExecutorConfig {
        caching,
        ..config.executor_config()
    });

    Fixture {
        executor,
        storage,
        cache,
        clock,
        stamps,
    }
}

fn label() -> PlanNode {
    PlanNode::leaf(FieldInfo::new("label", "Node"))
}

fn node(alias: &str, id: i64) -> PlanNode {
    PlanNode::field(
        FieldInfo::new("node", "Query")
            .with_alias(alias)
            .with_argument("id", id),
        label(),
    )
}

fn stamp(field: &str, label: &str) -> QueryPlan {
    QueryPlan::new(PlanNode::leaf(
        FieldInfo::new(field, "Query").with_argument("label", label),
    ))
}

fn language(code: &str) -> Context {
    Context::new().with("languages", json!({"language_interface": code}))
}

async fn run(fixture: &Fixture, plan: &QueryPlan, request: Context) -> Response {
    fixture.executor.execute(plan, request).await
}

fn ids(ids: &[i64]) -> Vec<EntityId> {
    ids.iter().copied().map(EntityId::Int).collect()
}

/// A group receives `[1, 3]` then `2`; one bulk load serves both items.
#[tokio::test]
async fn test_buffer_group_flushes_once() {
    let storage = Arc::new(nodes());
    let buffer = EntityBuffer::from_storage(storage.clone());

    let first = buffer.add_entities("node", vec![1, 3], None);
    let second = buffer.add_entities("node", 2, None);

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(storage.load_calls(), vec![("node".to_string(), ids(&[1, 3, 2]))]);

    let EntityLoad::Many(entities) = first else {
        panic!("expected a list load");
    };
    let labels: Vec<&str> = entities.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(labels, vec!["One", "Three"]);

    let EntityLoad::One(Some(entity)) = second else {
        panic!("expected a single entity");
    };
    assert_eq!(entity.label, "Two");
}

#[tokio::test]
async fn test_duplicate_ids_share_entities() {
    let storage = Arc::new(nodes());
    let buffer = EntityBuffer::from_storage(storage.clone());

    let pair = buffer.add_entities("node", vec![1, 2], None);
    let twice = buffer.add_entities("node", vec![2, 2], None);
    let single = buffer.add_entities("node", 3, None);
    let (pair, twice, single) = futures::join!(pair.into_future(), twice.into_future(), single.into_future());

    assert_eq!(storage.load_calls(), vec![("node".to_string(), ids(&[1, 2, 3]))]);
    assert_eq!(pair.unwrap().entities().len(), 2);
    assert!(matches!(single.unwrap(), EntityLoad::One(Some(_))));

    let twice = twice.unwrap();
    let entities: Vec<_> = twice.entities().collect();
    assert!(Arc::ptr_eq(entities[0], entities[1]));
}

#[tokio::test]
async fn test_sibling_fields_share_one_load() {
    let fixture = fixture(true);
    let plan = QueryPlan::new(PlanNode::parallel([
        node("a", 1),
        node("b", 2),
        PlanNode::field(
            FieldInfo::new("nodes", "Query").with_argument("ids", json!([3, 1])),
            label(),
        ),
    ]));

    let response = run(&fixture, &plan, Context::new()).await;

    assert!(!response.has_errors(), "{:?}", response.errors);
    assert_eq!(
        response.data.unwrap(),
        json!({
            "a": {"label": "One"},
            "b": {"label": "Two"},
            "nodes": [{"label": "Three"}, {"label": "One"}]
        })
    );

    let calls = fixture.storage.load_calls();
    assert_eq!(calls.len(), 1);
    let mut loaded = calls[0].1.clone();
    loaded.sort_by_key(|id| id.to_string());
    assert_eq!(loaded, ids(&[1, 2, 3]));

    for tag in ["node:1", "node:2", "node:3"] {
        assert!(response.metadata.tags.contains(tag), "missing {}", tag);
    }
}

#[tokio::test]
async fn test_concurrent_requests_load_separately() {
    let fixture = fixture(false);
    let first = QueryPlan::new(node("a", 1));
    let second = QueryPlan::new(node("b", 2));

    let (first, second) = futures::join!(
        run(&fixture, &first, Context::new()),
        run(&fixture, &second, Context::new())
    );

    assert_eq!(first.data.unwrap(), json!({"a": {"label": "One"}}));
    assert_eq!(second.data.unwrap(), json!({"b": {"label": "Two"}}));

    let mut calls = fixture.storage.load_calls();
    calls.sort_by_key(|(_, ids)| ids[0].to_string());
    assert_eq!(
        calls,
        vec![
            ("node".to_string(), ids(&[1])),
            ("node".to_string(), ids(&[2])),
        ]
    );
}

#[tokio::test]
async fn test_cache_hit_runs_producer_once() {
    let fixture = fixture(true);
    let plan = stamp("stamp", "home");

    let first = run(&fixture, &plan, language("en")).await;
    let second = run(&fixture, &plan, language("en")).await;

    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 1);
    assert_eq!(first.data, second.data);
    assert_eq!(second.data.unwrap()["stamp"], "home:en");
    assert!(second
        .metadata
        .contexts
        .contains("languages:language_interface"));
}

#[tokio::test]
async fn test_cache_keys_follow_context_values() {
    let fixture = fixture(true);
    let plan = stamp("stamp", "home");

    let en = run(&fixture, &plan, language("en")).await;
    let de = run(&fixture, &plan, language("de")).await;
    let en_again = run(&fixture, &plan, language("en")).await;

    assert_eq!(en.data.unwrap()["stamp"], "home:en");
    assert_eq!(de.data.unwrap()["stamp"], "home:de");
    assert_eq!(en_again.data.unwrap()["stamp"], "home:en");
    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_zero_max_age_is_never_stored() {
    let fixture = fixture(true);
    let plan = stamp("fresh", "home");

    let response = run(&fixture, &plan, language("en")).await;
    run(&fixture, &plan, language("en")).await;

    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 2);
    assert!(fixture.cache.is_empty().await);
    assert_eq!(response.metadata.max_age, MaxAge::Seconds(0));
}

#[tokio::test]
async fn test_expired_entries_are_recomputed() {
    let fixture = fixture(true);
    let plan = stamp("hourly", "home");

    run(&fixture, &plan, language("en")).await;
    fixture.clock.advance(3_599);
    run(&fixture, &plan, language("en")).await;
    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 1);

    fixture.clock.advance(2);
    run(&fixture, &plan, language("en")).await;
    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_tag_invalidation_purges_cached_fields() {
    let fixture = fixture(true);
    let plan = QueryPlan::new(node("a", 1));

    run(&fixture, &plan, Context::new()).await;
    let cached = run(&fixture, &plan, Context::new()).await;
    assert_eq!(fixture.storage.load_calls().len(), 1);
    assert!(cached.metadata.tags.contains("node:1"));

    fixture
        .cache
        .invalidate_tags(&["node:1".to_string()])
        .await
        .unwrap();
    let reloaded = run(&fixture, &plan, Context::new()).await;

    assert_eq!(fixture.storage.load_calls().len(), 2);
    assert_eq!(reloaded.data.unwrap(), json!({"a": {"label": "One"}}));
}

#[tokio::test]
async fn test_disabled_caching_always_recomputes() {
    let fixture = fixture(false);
    let plan = stamp("stamp", "home");

    run(&fixture, &plan, language("en")).await;
    run(&fixture, &plan, language("en")).await;

    assert_eq!(fixture.stamps.load(Ordering::SeqCst), 2);
    assert!(fixture.cache.is_empty().await);
}

#[tokio::test]
async fn test_missing_entity_is_null_not_error() {
    let fixture = fixture(true);
    let response = run(&fixture, &QueryPlan::new(node("a", 99)), Context::new()).await;

    assert!(!response.has_errors());
    assert_eq!(response.data.unwrap(), json!({"a": null}));
    assert!(response.metadata.tags.contains("node_list"));
}

#[tokio::test]
async fn test_bulk_failure_fails_every_item() {
    let fixture = fixture_with(nodes().with_failure("node"), true);
    let plan = QueryPlan::new(PlanNode::parallel([node("a", 1), node("b", 2)]));

    let response = run(&fixture, &plan, Context::new()).await;

    let errors = response.errors.clone().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].message, errors[1].message);
    insta::assert_snapshot!(
        &errors[0].message,
        @"bulk load for buffer group node failed: entity storage for 'node' is unavailable"
    );
    assert_eq!(errors[0].code(), Some("BUFFER_ERROR"));
    assert_eq!(fixture.storage.load_calls().len(), 1);
    assert_eq!(response.data.unwrap(), json!({"a": null, "b": null}));
    assert!(fixture.cache.is_empty().await);
}

#[tokio::test]
async fn test_configuration_errors_surface_per_field() {
    let storage = Arc::new(nodes());
    let registry = ProducerRegistry::with_builtins(storage.clone());
    let cache = Arc::new(MemoryCacheBackend::new());

    let mut resolvers = ResolverMap::new();
    resolvers.register(
        "Query",
        "shout",
        DataProducerProxy::new("uppercase")
            .map("text", Resolver::value("hi"))
            .cached(),
    );
    resolvers.register("Query", "quiet", Resolver::value("hi"));

    let executor = Executor::new(resolvers, Services::new(registry).with_cache(cache.clone()));
    let plan = QueryPlan::new(PlanNode::parallel([
        PlanNode::leaf(FieldInfo::new("shout", "Query")),
        PlanNode::leaf(FieldInfo::new("quiet", "Query")),
    ]));
    let response = executor.execute(&plan, Context::new()).await;

    let errors = response.errors.clone().unwrap();
    assert_eq!(
        errors[0].message,
        "data producer 'uppercase' has no input slot named 'text'"
    );
    assert_eq!(errors[0].code(), Some("CONFIGURATION_ERROR"));
    assert_eq!(response.data.unwrap(), json!({"shout": null, "quiet": "hi"}));
    assert!(cache.is_empty().await);
    assert!(storage.load_calls().is_empty());
}
