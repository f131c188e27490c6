use bundlestore::plugins::Tools;
use bundlestore::plugins::tools::{ToolSpec, ToolType};
use bundlestore::{
    BundleStore, ListItemsRequest, PutBundleRequest, PutItemRequest, SearchItemsRequest,
    StoreError, StoreOptions,
};
use serde_json::{Value, json};
use std::path::Path;
use tempfile::tempdir;

fn open(base: &Path) -> BundleStore<Tools> {
    let store = BundleStore::<Tools>::open(base, StoreOptions::default()).unwrap();
    store.wait_for_index().unwrap();
    store
}

fn body(value: Value) -> PutItemRequest<ToolSpec> {
    serde_json::from_value(value).unwrap()
}

fn weather_tool() -> PutItemRequest<ToolSpec> {
    body(json!({
        "displayName": "Weather",
        "description": "Current conditions for a city",
        "tags": ["weather"],
        "argSchema": {
            "type": "object",
            "properties": {"city": {"type": "string", "description": "City to look up"}}
        },
        "type": "http",
        "httpImpl": {
            "method": "GET",
            "urlTemplate": "https://weather.example/v1?q={{city}}",
            "headers": {"Accept": "application/json"},
            "timeoutMs": 5000
        }
    }))
}

fn hashing_tool() -> PutItemRequest<ToolSpec> {
    body(json!({
        "displayName": "Checksum",
        "argSchema": {"type": "object", "properties": {"data": {"type": "string"}}},
        "type": "native",
        "nativeImpl": {"name": "digest.sha256"}
    }))
}

fn search_slugs(store: &BundleStore<Tools>, query: &str) -> Vec<String> {
    store
        .search_items(SearchItemsRequest {
            query: query.to_string(),
            ..SearchItemsRequest::default()
        })
        .unwrap()
        .hits
        .into_iter()
        .map(|h| h.entry.slug)
        .collect()
}

fn user_bundle(store: &BundleStore<Tools>) {
    store
        .put_bundle(
            "team",
            PutBundleRequest {
                slug: "team".to_string(),
                display_name: "Team tools".to_string(),
                description: Some("tools the team maintains".to_string()),
                is_enabled: true,
            },
        )
        .unwrap();
}

#[test]
fn embedded_builtins_are_served() {
    let tmp = tempdir().unwrap();
    let store = open(tmp.path());

    let bundle = store.get_bundle("builtin-tools-web").unwrap();
    assert!(bundle.is_built_in);
    assert_eq!(bundle.slug, "web");

    let fetch = store.get_item("builtin-tools-web", "fetch-url", "v1").unwrap();
    assert!(fetch.is_built_in);
    assert_eq!(fetch.payload.tool_type, ToolType::Http);
    assert_eq!(fetch.payload.http_impl.as_ref().unwrap().method, "GET");

    let listed = store
        .list_items(ListItemsRequest {
            bundle_ids: vec!["builtin-tools-web".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert!(listed.items.len() >= 2);
    assert!(listed.items.iter().all(|e| e.is_built_in));

    assert!(matches!(
        store.get_item("builtin-tools-web", "fetch-url", "v9"),
        Err(StoreError::BuiltInItemNotFound(_))
    ));
}

#[test]
fn tool_files_keep_the_wire_shape() {
    let tmp = tempdir().unwrap();
    let store = open(tmp.path());
    user_bundle(&store);
    store.put_item("team", "weather", "1.0.0", weather_tool()).unwrap();

    let raw = std::fs::read_to_string(tmp.path().join("team_team").join("weather_1.0.0.json")).unwrap();
    let file: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(file["type"], "http");
    assert_eq!(file["slug"], "weather");
    assert_eq!(file["version"], "1.0.0");
    assert_eq!(file["isBuiltIn"], false);
    assert_eq!(file["httpImpl"]["urlTemplate"], "https://weather.example/v1?q={{city}}");
    assert!(file["argSchema"]["properties"]["city"].is_object());
}

#[test]
fn search_covers_params_and_impl_columns() {
    let tmp = tempdir().unwrap();
    let store = open(tmp.path());
    user_bundle(&store);
    store.put_item("team", "weather", "v1", weather_tool()).unwrap();
    store.put_item("team", "checksum", "v1", hashing_tool()).unwrap();

    assert_eq!(search_slugs(&store, "city"), vec!["weather".to_string()]);
    assert_eq!(search_slugs(&store, "digest"), vec!["checksum".to_string()]);
    let natives = search_slugs(&store, "native");
    assert!(natives.contains(&"checksum".to_string()));
    assert!(!natives.contains(&"weather".to_string()));
}

#[test]
fn invalid_specs_are_rejected() {
    let tmp = tempdir().unwrap();
    let store = open(tmp.path());
    user_bundle(&store);

    let mut mixed = weather_tool();
    mixed.payload.native_impl = hashing_tool().payload.native_impl;
    assert!(matches!(
        store.put_item("team", "mixed", "v1", mixed),
        Err(StoreError::InvalidRequest(_))
    ));

    let mut bad_method = weather_tool();
    if let Some(http) = bad_method.payload.http_impl.as_mut() {
        http.method = "TRACE".to_string();
    }
    assert!(matches!(
        store.put_item("team", "weather", "v1", bad_method),
        Err(StoreError::InvalidRequest(_))
    ));

    let mut no_impl = hashing_tool();
    no_impl.payload.native_impl = None;
    assert!(matches!(
        store.put_item("team", "checksum", "v1", no_impl),
        Err(StoreError::InvalidRequest(_))
    ));

    let mut bad_schema = weather_tool();
    bad_schema.payload.arg_schema = json!(["city"]);
    assert!(matches!(
        store.put_item("team", "weather", "v1", bad_schema),
        Err(StoreError::InvalidRequest(_))
    ));

    // Nothing above reached the disk.
    let listed = store
        .list_items(ListItemsRequest {
            bundle_ids: vec!["team".to_string()],
            include_disabled: true,
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert!(listed.items.is_empty());

    store.put_item("team", "weather", "v1", weather_tool()).unwrap();
}

#[test]
fn bad_names_are_rejected_before_any_lookup() {
    let tmp = tempdir().unwrap();
    let store = open(tmp.path());
    assert!(matches!(
        store.put_item("team", "has_underscore", "v1", weather_tool()),
        Err(StoreError::InvalidSlug(..))
    ));
    assert!(matches!(
        store.put_item("team", "weather", "v 1", weather_tool()),
        Err(StoreError::InvalidVersion(..))
    ));
    assert!(matches!(
        store.put_item("missing", "weather", "v1", weather_tool()),
        Err(StoreError::BundleNotFound(_))
    ));
    assert!(matches!(
        store.get_item("", "weather", "v1"),
        Err(StoreError::InvalidRequest(_))
    ));
}

#[test]
fn builtin_item_flag_persists_across_reopen() {
    let tmp = tempdir().unwrap();
    {
        let store = open(tmp.path());
        let patched = store
            .patch_item("builtin-tools-web", "fetch-url", "v1", false)
            .unwrap();
        assert!(!patched.is_enabled);
        assert!(!search_slugs(&store, "fetch").contains(&"fetch-url".to_string()));
    }
    let store = open(tmp.path());
    assert!(!store.get_item("builtin-tools-web", "fetch-url", "v1").unwrap().is_enabled);
    assert!(!search_slugs(&store, "fetch").contains(&"fetch-url".to_string()));

    store.patch_item("builtin-tools-web", "fetch-url", "v1", true).unwrap();
    assert!(search_slugs(&store, "fetch").contains(&"fetch-url".to_string()));
}
