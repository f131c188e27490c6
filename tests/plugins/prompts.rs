use bundlestore::core::assets::MemoryTree;
use bundlestore::core::fts::{FtsColumn, FtsEngine};
use bundlestore::core::time::ManualClock;
use bundlestore::plugins::Prompts;
use bundlestore::plugins::prompts::{MessageBlock, PromptRole, PromptTemplate, PromptVariable};
use bundlestore::store::FTS_FILE_NAME;
use bundlestore::{
    BundleStore, ListBundlesRequest, ListItemsRequest, PutBundleRequest, PutItemRequest,
    SearchItemsRequest, StoreError, StoreOptions,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn builtin_tree() -> MemoryTree {
    MemoryTree::new()
        .with_file(
            "bundles.json",
            json!({"bundles": {"builtin-b1": {
                "id": "builtin-b1", "slug": "core", "displayName": "Core",
                "isEnabled": true, "createdAt": "2026-01-01T00:00:00Z",
                "modifiedAt": "2026-01-01T00:00:00Z"
            }}})
            .to_string(),
        )
        .with_file(
            "builtin-b1_core/greet_v1.json",
            builtin_item("bi-1", "greet", "v1", "good morning"),
        )
        .with_file(
            "builtin-b1_core/greet_v2.json",
            builtin_item("bi-2", "greet", "v2", "good morning, {{name}}"),
        )
}

fn builtin_item(id: &str, slug: &str, version: &str, content: &str) -> String {
    let variables = if content.contains("{{name}}") {
        json!([{"name": "name", "required": true}])
    } else {
        json!([])
    };
    json!({
        "id": id, "slug": slug, "version": version, "displayName": "Morning greeting",
        "isEnabled": true, "createdAt": "2026-01-01T00:00:00Z",
        "modifiedAt": "2026-01-01T00:00:00Z",
        "blocks": [{"role": "system", "content": content}],
        "variables": variables
    })
    .to_string()
}

fn open_with(base: &Path, clock: Arc<ManualClock>, fts_enabled: bool) -> BundleStore<Prompts> {
    let options = StoreOptions {
        fts_enabled,
        clock,
        ..StoreOptions::default()
    };
    let store = BundleStore::<Prompts>::open_with_tree(base, &builtin_tree(), options).unwrap();
    store.wait_for_index().unwrap();
    store
}

fn clock() -> Arc<ManualClock> {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
}

fn bundle(slug: &str, display: &str) -> PutBundleRequest {
    PutBundleRequest {
        slug: slug.to_string(),
        display_name: display.to_string(),
        description: None,
        is_enabled: true,
    }
}

fn prompt(display: &str, content: &str) -> PutItemRequest<PromptTemplate> {
    PutItemRequest {
        display_name: display.to_string(),
        description: None,
        tags: Vec::new(),
        is_enabled: true,
        payload: PromptTemplate {
            blocks: vec![MessageBlock {
                role: PromptRole::User,
                content: content.to_string(),
            }],
            variables: Vec::new(),
        },
    }
}

fn search(store: &BundleStore<Prompts>, query: &str, include_disabled: bool) -> Vec<(String, String, String)> {
    store
        .search_items(SearchItemsRequest {
            query: query.to_string(),
            include_disabled,
            ..SearchItemsRequest::default()
        })
        .unwrap()
        .hits
        .into_iter()
        .map(|h| (h.entry.bundle_id, h.entry.slug, h.entry.version))
        .collect()
}

#[test]
fn create_list_get() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);

    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    let put = store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();

    let got = store.get_item("b1", "t1", "v1").unwrap();
    assert_eq!(got, put);
    assert!(!got.is_built_in);
    assert!(got.is_enabled);
    let id = uuid::Uuid::parse_str(&got.id).unwrap();
    assert_eq!(id.get_version_num(), 7);
    assert!(tmp.path().join("b1_s1").join("t1_v1.json").exists());

    let listed = store
        .list_items(ListItemsRequest {
            bundle_ids: vec!["b1".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(listed.items.len(), 1);
    let entry = &listed.items[0];
    assert_eq!(
        (entry.bundle_id.as_str(), entry.bundle_slug.as_str(), entry.slug.as_str(), entry.version.as_str()),
        ("b1", "s1", "t1", "v1")
    );
    assert!(listed.next_page_token.is_none());

    let wire = serde_json::to_value(entry).unwrap();
    assert_eq!(wire["bundleID"], "b1");
    assert_eq!(wire["bundleSlug"], "s1");
}

#[test]
fn put_item_conflicts_on_existing_version() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();

    let again = store.put_item("b1", "t1", "v1", prompt("T1 again", "hi"));
    assert!(matches!(again, Err(StoreError::Conflict(_))));
    store.put_item("b1", "t1", "v2", prompt("T1", "hi there")).unwrap();

    let all = store
        .list_items(ListItemsRequest {
            include_disabled: true,
            all_versions: true,
            bundle_ids: vec!["b1".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    let versions: BTreeSet<String> = all.items.into_iter().map(|e| e.version).collect();
    assert_eq!(versions, BTreeSet::from(["v1".to_string(), "v2".to_string()]));
}

#[test]
fn disabled_bundle_blocks_new_items() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();

    let patched = store.patch_bundle("b1", false).unwrap();
    assert!(!patched.is_enabled);
    assert!(matches!(
        store.put_item("b1", "t2", "v1", prompt("T2", "hi")),
        Err(StoreError::BundleDisabled(_))
    ));

    // Existing items stay readable and patchable.
    assert!(store.get_item("b1", "t1", "v1").is_ok());
    assert!(!store.patch_item("b1", "t1", "v1", false).unwrap().is_enabled);
}

#[test]
fn soft_delete_then_sweep_after_grace() {
    let tmp = tempdir().unwrap();
    let clock = clock();
    let store = open_with(tmp.path(), clock.clone(), false);

    store.put_bundle("b2", bundle("s2", "B2")).unwrap();
    store.put_item("b2", "t1", "v1", prompt("T1", "hi")).unwrap();
    assert!(matches!(store.delete_bundle("b2"), Err(StoreError::BundleNotEmpty(_))));

    store.delete_item("b2", "t1", "v1").unwrap();
    store.delete_bundle("b2").unwrap();
    assert!(matches!(store.get_bundle("b2"), Err(StoreError::BundleDeleting(_))));
    assert!(matches!(store.delete_bundle("b2"), Err(StoreError::BundleDeleting(_))));
    assert!(matches!(
        store.put_bundle("b2", bundle("s2", "B2")),
        Err(StoreError::BundleDeleting(_))
    ));

    // Still inside the grace period.
    clock.advance(Duration::from_secs(47 * 3600));
    store.sweep_now().unwrap();
    assert!(matches!(store.get_bundle("b2"), Err(StoreError::BundleDeleting(_))));

    clock.advance(Duration::from_secs(2 * 3600));
    store.sweep_now().unwrap();
    assert!(matches!(store.get_bundle("b2"), Err(StoreError::BundleNotFound(_))));
    assert!(!tmp.path().join("b2_s2").exists());

    let listed = store
        .list_bundles(ListBundlesRequest {
            include_disabled: true,
            ..ListBundlesRequest::default()
        })
        .unwrap();
    assert!(listed.bundles.iter().all(|b| b.id != "b2"));
}

#[test]
fn builtin_bundles_are_read_only_but_patchable() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);

    assert!(matches!(
        store.put_bundle("builtin-b1", bundle("core", "Core")),
        Err(StoreError::BuiltInReadOnly(_))
    ));
    assert!(matches!(store.delete_bundle("builtin-b1"), Err(StoreError::BuiltInReadOnly(_))));
    assert!(matches!(
        store.put_item("builtin-b1", "x", "v1", prompt("X", "x")),
        Err(StoreError::BuiltInReadOnly(_))
    ));
    assert!(matches!(
        store.delete_item("builtin-b1", "greet", "v1"),
        Err(StoreError::BuiltInReadOnly(_))
    ));

    let patched = store.patch_bundle("builtin-b1", false).unwrap();
    assert!(!patched.is_enabled);
    assert!(patched.is_built_in);

    let visible = store.list_bundles(ListBundlesRequest::default()).unwrap();
    assert!(visible.bundles.iter().all(|b| b.id != "builtin-b1"));

    let all = store
        .list_bundles(ListBundlesRequest {
            include_disabled: true,
            ..ListBundlesRequest::default()
        })
        .unwrap();
    let b = all.bundles.iter().find(|b| b.id == "builtin-b1").unwrap();
    assert!(!b.is_enabled);
    assert!(b.is_built_in);
    drop(store);

    // The flag lives in the overlay file and survives a reopen.
    let reopened = open_with(tmp.path(), clock(), true);
    assert!(!reopened.get_bundle("builtin-b1").unwrap().is_enabled);
}

#[test]
fn search_follows_item_mutations() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();

    store.put_item("b1", "hello", "v1", prompt("Greeter", "hello world")).unwrap();
    assert_eq!(
        search(&store, "hello", false),
        vec![("b1".to_string(), "hello".to_string(), "v1".to_string())]
    );

    store.patch_item("b1", "hello", "v1", false).unwrap();
    assert!(search(&store, "hello", false).is_empty());
    assert_eq!(search(&store, "hello", true).len(), 1);

    store.delete_item("b1", "hello", "v1").unwrap();
    assert!(search(&store, "hello", true).is_empty());
}

#[test]
fn search_respects_bundle_flag_and_builtin_patches() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);

    assert_eq!(search(&store, "morning", false).len(), 2);
    store.patch_item("builtin-b1", "greet", "v1", false).unwrap();
    let hits = search(&store, "morning", false);
    assert_eq!(hits, vec![("builtin-b1".to_string(), "greet".to_string(), "v2".to_string())]);

    store.patch_bundle("builtin-b1", false).unwrap();
    assert!(search(&store, "morning", false).is_empty());
    assert_eq!(search(&store, "morning", true).len(), 2);
}

#[test]
fn search_requires_fts() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    let res = store.search_items(SearchItemsRequest {
        query: "anything".to_string(),
        ..SearchItemsRequest::default()
    });
    assert!(matches!(res, Err(StoreError::FtsDisabled)));
    assert!(matches!(store.reindex(), Err(StoreError::FtsDisabled)));
}

#[test]
fn paginated_search_never_repeats_a_hit() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    for i in 0..30 {
        store
            .put_item("b1", &format!("alpha-{:02}", i), "v1", prompt("Alpha", "alpha beta"))
            .unwrap();
    }
    for i in 0..5 {
        store.patch_item("b1", &format!("alpha-{:02}", i), "v1", false).unwrap();
    }

    let mut seen = BTreeSet::new();
    let mut token: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = store
            .search_items(SearchItemsRequest {
                query: "alpha".to_string(),
                page_size: 4,
                page_token: token.clone(),
                include_disabled: false,
            })
            .unwrap();
        pages += 1;
        assert!(page.hits.len() <= 4);
        assert!(!page.hits.is_empty(), "no empty pages");
        for hit in page.hits {
            assert!(seen.insert((hit.entry.slug, hit.entry.version)), "hit repeated");
        }
        match page.next_page_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }
    assert_eq!(seen.len(), 25);
    assert!(pages >= 7);
}

#[test]
fn list_items_drains_every_version_once() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    for b in ["b1", "b2"] {
        store.put_bundle(b, bundle(&format!("{}-slug", b), b)).unwrap();
        for i in 0..7 {
            store
                .put_item(b, &format!("item-{}", i % 3), &format!("v{}", i), prompt("Item", "text"))
                .unwrap();
        }
    }

    let mut seen = BTreeSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = store
            .list_items(ListItemsRequest {
                page_size: 3,
                page_token: token.clone(),
                all_versions: true,
                ..ListItemsRequest::default()
            })
            .unwrap();
        for e in page.items {
            assert!(seen.insert((e.bundle_id, e.slug, e.version)), "entry repeated");
        }
        match page.next_page_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }
    // 14 user versions plus the two built-ins.
    assert_eq!(seen.len(), 16);
}

#[test]
fn list_items_keeps_newest_version_per_slug() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    for v in ["v1", "v2", "v3"] {
        store.put_item("b1", "t1", v, prompt("T1", "text")).unwrap();
    }
    store.put_item("b1", "t2", "v1", prompt("T2", "text")).unwrap();

    let first = store
        .list_items(ListItemsRequest {
            page_size: 1,
            bundle_ids: vec!["b1".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(first.items.len(), 1);
    assert_eq!((first.items[0].slug.as_str(), first.items[0].version.as_str()), ("t2", "v1"));

    let second = store
        .list_items(ListItemsRequest {
            page_token: first.next_page_token,
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(second.items.len(), 1);
    assert_eq!((second.items[0].slug.as_str(), second.items[0].version.as_str()), ("t1", "v3"));
    assert!(second.next_page_token.is_none());

    let builtins = store
        .list_items(ListItemsRequest {
            bundle_ids: vec!["builtin-b1".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(builtins.items.len(), 1);
    assert_eq!(builtins.items[0].version, "v2");
    assert!(builtins.items[0].is_built_in);
}

#[test]
fn list_items_filters_by_tag_and_flag() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    let mut tagged = prompt("Tagged", "text");
    tagged.tags = vec!["ops".to_string(), "daily".to_string()];
    store.put_item("b1", "tagged", "v1", tagged).unwrap();
    store.put_item("b1", "plain", "v1", prompt("Plain", "text")).unwrap();
    let mut off = prompt("Off", "text");
    off.is_enabled = false;
    off.tags = vec!["ops".to_string()];
    store.put_item("b1", "off", "v1", off).unwrap();

    let ops = store
        .list_items(ListItemsRequest {
            tags: vec!["ops".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    let slugs: Vec<String> = ops.items.into_iter().map(|e| e.slug).collect();
    assert_eq!(slugs, vec!["tagged".to_string()]);

    let ops_all = store
        .list_items(ListItemsRequest {
            tags: vec!["ops".to_string()],
            include_disabled: true,
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(ops_all.items.len(), 2);
}

#[test]
fn list_bundles_pages_newest_first() {
    let tmp = tempdir().unwrap();
    let clock = clock();
    let store = open_with(tmp.path(), clock.clone(), false);
    for i in 0..5 {
        clock.advance(Duration::from_secs(60));
        store.put_bundle(&format!("u{}", i), bundle(&format!("s{}", i), "U")).unwrap();
    }

    let mut ids = Vec::new();
    let mut token = None;
    loop {
        let page = store
            .list_bundles(ListBundlesRequest {
                page_size: 2,
                page_token: token,
                ..ListBundlesRequest::default()
            })
            .unwrap();
        ids.extend(page.bundles.into_iter().map(|b| b.id));
        match page.next_page_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }
    assert_eq!(ids, vec!["u4", "u3", "u2", "u1", "u0", "builtin-b1"]);
}

#[test]
fn put_bundle_guards_slug_reuse() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    let created = store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    assert!(matches!(
        store.put_bundle("b9", bundle("s1", "B9")),
        Err(StoreError::Conflict(_))
    ));
    assert!(matches!(
        store.put_bundle("b1", bundle("Bad Slug", "B1")),
        Err(StoreError::InvalidSlug(..))
    ));

    let renamed = store.put_bundle("b1", bundle("s1-new", "B1")).unwrap();
    assert_eq!(renamed.created_at, created.created_at);
    store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();
    assert!(matches!(
        store.put_bundle("b1", bundle("s1-other", "B1")),
        Err(StoreError::InvalidRequest(_))
    ));
}

#[test]
fn put_bundle_refuses_a_directory_held_by_a_deleted_bundle() {
    let tmp = tempdir().unwrap();
    let clock = clock();
    let store = open_with(tmp.path(), clock.clone(), true);

    // "a!" sanitizes to the same directory as "a".
    store.put_bundle("a!", bundle("s", "Old")).unwrap();
    store.delete_bundle("a!").unwrap();
    assert!(matches!(store.put_bundle("a", bundle("s", "New")), Err(StoreError::Conflict(_))));
    store.put_bundle("a", bundle("other", "New")).unwrap();

    clock.advance(Duration::from_secs(49 * 3600));
    assert_eq!(store.sweep_now().unwrap(), vec!["a!".to_string()]);
    store.put_bundle("a", bundle("s", "New")).unwrap();
    store.put_item("a", "hello", "v1", prompt("Hello", "zebra crossing")).unwrap();

    let listed = store.list_items(ListItemsRequest::default()).unwrap();
    assert!(listed.items.iter().any(|e| e.bundle_id == "a" && e.slug == "hello"));
    assert_eq!(
        search(&store, "zebra", false),
        vec![("a".to_string(), "hello".to_string(), "v1".to_string())]
    );
}

#[test]
fn live_bundle_keeps_a_directory_shared_with_a_deleted_record() {
    let tmp = tempdir().unwrap();
    let record = |id: &str, deleted: Option<&str>| {
        let mut b = json!({
            "id": id, "slug": "s", "displayName": id, "isEnabled": true,
            "createdAt": "2026-01-01T00:00:00Z", "modifiedAt": "2026-01-01T00:00:00Z"
        });
        if let Some(at) = deleted {
            b["softDeletedAt"] = json!(at);
        }
        b
    };
    // Written before this store refused such pairs.
    std::fs::write(
        tmp.path().join("bundles_meta.json"),
        json!({"bundles": {
            "a": record("a", None),
            "a!": record("a!", Some("2026-01-02T00:00:00Z")),
        }})
        .to_string(),
    )
    .unwrap();
    std::fs::create_dir_all(tmp.path().join("a_s")).unwrap();
    std::fs::write(
        tmp.path().join("a_s").join("hello_v1.json"),
        json!({
            "id": "u-1", "slug": "hello", "version": "v1", "displayName": "Hello",
            "isEnabled": true, "createdAt": "2026-01-01T00:00:00Z",
            "modifiedAt": "2026-01-01T00:00:00Z",
            "blocks": [{"role": "user", "content": "zebra crossing"}]
        })
        .to_string(),
    )
    .unwrap();

    let store = open_with(tmp.path(), clock(), true);
    let listed = store.list_items(ListItemsRequest::default()).unwrap();
    assert!(listed.items.iter().any(|e| e.bundle_id == "a" && e.slug == "hello"));
    assert_eq!(search(&store, "zebra", false).len(), 1);

    // The deleted record goes; the directory it shared stays.
    assert_eq!(store.sweep_now().unwrap(), vec!["a!".to_string()]);
    assert!(tmp.path().join("a_s").join("hello_v1.json").is_file());
    assert!(store.get_item("a", "hello", "v1").is_ok());
    assert!(matches!(store.get_bundle("a!"), Err(StoreError::BundleNotFound(_))));
}

#[test]
fn bundle_recreated_during_a_sweep_keeps_its_items() {
    let tmp = tempdir().unwrap();
    let clock = clock();
    let store = open_with(tmp.path(), clock.clone(), false);

    for round in 0..20 {
        let version = format!("v{}", round);
        store.put_bundle("b", bundle("s", "B")).unwrap();
        store.delete_bundle("b").unwrap();
        clock.advance(Duration::from_secs(49 * 3600));

        std::thread::scope(|scope| {
            let sweeper = scope.spawn(|| store.sweep_now().unwrap());
            loop {
                match store.put_bundle("b", bundle("s", "B")) {
                    Ok(_) => break,
                    Err(StoreError::BundleDeleting(_)) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            store.put_item("b", "t", &version, prompt("T", "hi")).unwrap();
            sweeper.join().unwrap();
        });

        assert!(store.get_item("b", "t", &version).is_ok());
        assert!(tmp.path().join("b_s").join(format!("t_{}.json", version)).is_file());
        store.delete_item("b", "t", &version).unwrap();
    }
}

#[test]
fn zero_sweep_interval_is_raised_to_the_floor() {
    let tmp = tempdir().unwrap();
    let options = StoreOptions {
        fts_enabled: false,
        sweep_interval: Duration::ZERO,
        ..StoreOptions::default()
    };
    let store = BundleStore::<Prompts>::open_with_tree(tmp.path(), &builtin_tree(), options).unwrap();
    assert!(store.options().sweep_interval >= Duration::from_secs(1));
    store.close().unwrap();
}

#[test]
fn racing_builtin_patches_leave_index_matching_the_flag() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);

    std::thread::scope(|scope| {
        for t in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for i in 0..25 {
                    store.patch_item("builtin-b1", "greet", "v1", (i + t) % 2 == 0).unwrap();
                }
            });
        }
    });

    store.patch_item("builtin-b1", "greet", "v1", false).unwrap();
    assert!(!store.get_item("builtin-b1", "greet", "v1").unwrap().is_enabled);
    assert_eq!(
        search(&store, "morning", false),
        vec![("builtin-b1".to_string(), "greet".to_string(), "v2".to_string())]
    );

    store.patch_item("builtin-b1", "greet", "v1", true).unwrap();
    assert_eq!(search(&store, "morning", false).len(), 2);
}

#[test]
fn non_canonical_file_names_are_not_listed() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();

    // Decodes to t1_v1 but is not how that name is written.
    let dir = tmp.path().join("b1_s1");
    std::fs::copy(dir.join("t1_v1.json"), dir.join("t%31_v1.json")).unwrap();
    let listed = store
        .list_items(ListItemsRequest {
            all_versions: true,
            bundle_ids: vec!["b1".to_string()],
            ..ListItemsRequest::default()
        })
        .unwrap();
    assert_eq!(listed.items.len(), 1);
}

#[test]
fn domain_validation_rejects_undeclared_placeholders() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();

    let bad = prompt("Bad", "hi {{who}}");
    assert!(matches!(
        store.put_item("b1", "bad", "v1", bad),
        Err(StoreError::InvalidRequest(_))
    ));
    assert!(!tmp.path().join("b1_s1").join("bad_v1.json").exists());

    let mut good = prompt("Good", "hi {{who}}");
    good.payload.variables = vec![PromptVariable {
        name: "who".to_string(),
        description: None,
        required: true,
        default: None,
    }];
    store.put_item("b1", "good", "v1", good).unwrap();
}

#[test]
fn get_item_rejects_a_file_naming_another_version() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), false);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    store.put_item("b1", "t1", "v1", prompt("T1", "hi")).unwrap();

    let dir = tmp.path().join("b1_s1");
    std::fs::copy(dir.join("t1_v1.json"), dir.join("t1_v2.json")).unwrap();
    assert!(matches!(
        store.get_item("b1", "t1", "v2"),
        Err(StoreError::InvalidFilename(..))
    ));
    assert!(matches!(
        store.get_item("b1", "t1", "v7"),
        Err(StoreError::ItemNotFound(_))
    ));
}

#[test]
fn reconcilers_repair_a_drifted_index() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);
    store.put_bundle("b1", bundle("s1", "B1")).unwrap();
    store.put_item("b1", "kept", "v1", prompt("Kept", "zebra")).unwrap();
    store.put_item("b1", "gone", "v1", prompt("Gone", "zebra")).unwrap();
    assert_eq!(store.index_stats().unwrap(), 4);

    // Remove a file behind the store's back.
    std::fs::remove_file(tmp.path().join("b1_s1").join("gone_v1.json")).unwrap();
    let stats = store.reindex().unwrap();
    assert_eq!(stats.user.deleted, 1);
    assert_eq!(stats.builtin.visited, 2);
    assert_eq!(stats.builtin.deleted, 0);
    assert_eq!(store.index_stats().unwrap(), 3);
    assert_eq!(search(&store, "zebra", true).len(), 1);

    // Nothing changed since: a second pass writes nothing.
    let again = store.reindex().unwrap();
    assert_eq!(again.user.upserted, 0);
    assert_eq!(again.builtin.upserted, 0);
}

#[test]
fn schema_change_rebuilds_the_index() {
    let tmp = tempdir().unwrap();
    {
        let store = open_with(tmp.path(), clock(), true);
        store.put_bundle("b1", bundle("s1", "B1")).unwrap();
        store.put_item("b1", "hello", "v1", prompt("Greeter", "hello world")).unwrap();
    }

    // A different column set under the same table name.
    {
        let other = FtsEngine::open(
            tmp.path().join(FTS_FILE_NAME),
            "prompts",
            vec![FtsColumn::indexed("legacy", 1.0), FtsColumn::unindexed("mtime")],
        )
        .unwrap();
        assert!(other.was_recreated());
        assert_eq!(other.count().unwrap(), 0);
    }

    let store = open_with(tmp.path(), clock(), true);
    assert_eq!(search(&store, "hello", false).len(), 1);
    assert_eq!(store.index_stats().unwrap(), 3);
}

#[test]
fn closed_store_rejects_calls() {
    let tmp = tempdir().unwrap();
    let store = open_with(tmp.path(), clock(), true);
    store.close().unwrap();
    assert!(store.is_closed());
    assert!(matches!(store.get_bundle("builtin-b1"), Err(StoreError::Closed)));
    assert!(matches!(
        store.put_bundle("b1", bundle("s1", "B1")),
        Err(StoreError::Closed)
    ));
    // Idempotent.
    store.close().unwrap();
}
