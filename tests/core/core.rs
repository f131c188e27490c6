use bundlestore::core::assets::{AssetTree, DirTree, EmbeddedTree, MemoryTree, PromptAssets};
use bundlestore::core::config::StoreConfig;
use bundlestore::core::dirstore::{DirNameProvider, DirPartitionStore, FileKey, ListFilesConfig, SortOrder};
use bundlestore::core::error::{Result, StoreError};
use bundlestore::core::fts::{FtsColumn, FtsEngine, FtsValues};
use bundlestore::core::mapfile::{FileEvent, FileListener, FileOp, JsonMap, MapFileOptions, MapFileStore};
use bundlestore::core::names;
use bundlestore::core::overlay::{FlagKey, OverlayStore};
use bundlestore::core::rebuilder::AsyncRebuilder;
use bundlestore::core::task;
use bundlestore::core::time::ManualClock;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(FileOp, String, bool)>>,
}

impl FileListener for RecordingListener {
    fn on_file_event(&self, event: &FileEvent<'_>) -> Result<()> {
        let name = event
            .file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.events
            .lock()
            .unwrap()
            .push((event.op, name, event.data.is_some()));
        Ok(())
    }
}

fn map(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

#[test]
fn names_round_trip_and_reject_garbage() {
    for (slug, version) in [("hello", "v1"), ("a-b-c", "1.2.3"), ("X9", "2026.01")] {
        let file = names::item_file_name(slug, version).unwrap();
        assert_eq!(
            names::parse_item_file_name(&file).unwrap(),
            (slug.to_string(), version.to_string())
        );
    }
    assert!(matches!(names::validate_slug(""), Err(StoreError::InvalidSlug(..))));
    assert!(matches!(names::validate_slug("a b"), Err(StoreError::InvalidSlug(..))));
    assert!(matches!(names::validate_version("v/1"), Err(StoreError::InvalidVersion(..))));
    assert!(names::parse_item_file_name("no-extension").is_err());
    // Decodes to t1_v1, but only the canonical spelling names that item.
    assert!(names::parse_item_file_name("t%31_v1.json").is_err());

    let dir = names::bundle_dir_name("team/x", "s1").unwrap();
    assert!(!dir.contains('/'));
    assert!(dir.ends_with("_s1"));
}

#[test]
fn map_file_store_notifies_listeners_after_writes() {
    let tmp = tempdir().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let store = MapFileStore::open(
        tmp.path().join("doc.json"),
        map(json!({"a": 1})),
        MapFileOptions {
            listeners: vec![listener.clone() as Arc<dyn FileListener>],
            ..MapFileOptions::default()
        },
    )
    .unwrap();

    store.set_key(&["nested", "k"], json!("v")).unwrap();
    assert_eq!(store.get_key(&["nested", "k"]).unwrap(), Some(json!("v")));
    assert!(store.delete_key(&["nested", "k"]).unwrap());
    store.reset().unwrap();
    assert_eq!(store.get_all(true).unwrap(), map(json!({"a": 1})));
    store.delete_file().unwrap();
    assert!(!store.exists());

    let events = listener.events.lock().unwrap().clone();
    let ops: Vec<FileOp> = events.iter().map(|(op, _, _)| *op).collect();
    assert_eq!(ops, vec![FileOp::Set, FileOp::Set, FileOp::Reset, FileOp::Delete]);
    assert!(events.iter().all(|(_, name, _)| name == "doc.json"));
    assert!(!events[3].2, "delete carries no data");
}

#[test]
fn map_file_store_without_auto_flush_writes_on_flush() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("lazy.json");
    let store = MapFileStore::open(
        &path,
        JsonMap::new(),
        MapFileOptions {
            auto_flush: false,
            ..MapFileOptions::default()
        },
    )
    .unwrap();
    store.set_key(&["x"], json!(1)).unwrap();
    let on_disk: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert!(on_disk.get("x").is_none());

    store.flush().unwrap();
    let on_disk: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["x"], 1);
}

#[test]
fn dir_partition_store_pages_across_partitions() {
    let tmp = tempdir().unwrap();
    let store = DirPartitionStore::new(tmp.path(), Arc::new(DirNameProvider), Vec::new()).unwrap();
    for dir in ["a_one", "b_two", "c_three"] {
        for i in 0..3 {
            store
                .set_file_data(&FileKey::new(dir, format!("f{}.json", i)), map(json!({"i": i})))
                .unwrap();
        }
    }

    for order in [SortOrder::Asc, SortOrder::Desc] {
        let config = ListFilesConfig {
            sort_order: order,
            page_size: 2,
            ..ListFilesConfig::default()
        };
        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let (page, next) = store.list_files(&config, token.as_deref()).unwrap();
            assert!(page.len() <= 2);
            seen.extend(page);
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen.iter().collect::<BTreeSet<_>>().len(), 9);
        if order == SortOrder::Desc {
            assert_eq!(seen[0], "c_three/f2.json");
        } else {
            assert_eq!(seen[0], "a_one/f0.json");
        }
    }

    let only_b = ListFilesConfig {
        page_size: 10,
        filter_partitions: Some(vec!["b_two".to_string()]),
        ..ListFilesConfig::default()
    };
    let (files, next) = store.list_files(&only_b, None).unwrap();
    assert_eq!(files.len(), 3);
    assert!(next.is_none());

    store.delete_file(&FileKey::new("b_two", "f0.json")).unwrap();
    assert!(!store.file_exists(&FileKey::new("b_two", "f0.json")).unwrap());
    store.remove_partition("b_two").unwrap();
    assert!(!tmp.path().join("b_two").exists());
}

#[test]
fn fts_engine_ranks_by_weight_and_pages() {
    let tmp = tempdir().unwrap();
    let fts = FtsEngine::open(
        tmp.path().join("s.sqlite"),
        "docs",
        vec![
            FtsColumn::indexed("title", 5.0),
            FtsColumn::indexed("body", 1.0),
            FtsColumn::unindexed("mtime"),
        ],
    )
    .unwrap();
    let doc = |title: &str, body: &str| {
        FtsValues::from([
            ("title".to_string(), title.to_string()),
            ("body".to_string(), body.to_string()),
            ("mtime".to_string(), "t0".to_string()),
        ])
    };
    fts.upsert("in-body", &doc("other", "rust rust storage")).unwrap();
    fts.upsert("in-title", &doc("rust", "storage")).unwrap();
    for i in 0..5 {
        fts.upsert(&format!("filler-{}", i), &doc("rust notes", "misc")).unwrap();
    }
    assert_eq!(fts.count().unwrap(), 7);

    let (first, token) = fts.search("rust", None, 3).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].values.get("mtime").map(String::as_str), Some("t0"));
    let token = token.unwrap();
    let (rest, end) = fts.search("rust", Some(&token), 10).unwrap();
    assert_eq!(first.len() + rest.len(), 7);
    assert!(end.is_none());
    let ids: BTreeSet<String> = first.iter().chain(rest.iter()).map(|h| h.doc_id.clone()).collect();
    assert_eq!(ids.len(), 7);

    // A token from another query restarts at the top.
    let (other, _) = fts.search("storage", Some(&token), 10).unwrap();
    assert_eq!(other.len(), 2);

    fts.delete_batch(&["in-body".to_string(), "in-title".to_string()]).unwrap();
    assert_eq!(fts.count().unwrap(), 5);
    let (none, _) = fts.search("   ", None, 10).unwrap();
    assert!(none.is_empty());
}

struct BundleFlag(&'static str);

impl FlagKey for BundleFlag {
    const GROUP: &'static str = "bundles";

    fn key_id(&self) -> String {
        self.0.to_string()
    }
}

#[test]
fn overlay_flags_are_idempotent_and_persist() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("overlay.json");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());

    let overlay = OverlayStore::builder(&path)
        .register::<BundleFlag>()
        .open(clock.clone())
        .unwrap();
    overlay.set_flag(&BundleFlag("b1"), false).unwrap();
    let first = fs::read_to_string(&path).unwrap();
    overlay.set_flag(&BundleFlag("b1"), false).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), first);

    clock.advance(Duration::from_secs(60));
    let rec = overlay.set_flag(&BundleFlag("b1"), true).unwrap();
    assert!(rec.value);
    assert_eq!(rec.modified_at, Utc.with_ymd_and_hms(2026, 4, 1, 0, 1, 0).unwrap());
    drop(overlay);

    let reopened = OverlayStore::builder(&path)
        .register::<BundleFlag>()
        .open(clock)
        .unwrap();
    let flags = reopened.group_flags("bundles").unwrap();
    assert_eq!(flags.len(), 1);
    assert!(flags["b1"].value);
    assert!(reopened.get_flag(&BundleFlag("b2")).unwrap().is_none());
}

#[test]
fn rebuilder_runs_one_build_at_a_time() {
    let runs = Arc::new(AtomicUsize::new(0));
    let rebuilder = {
        let runs = runs.clone();
        AsyncRebuilder::new("test", Duration::from_secs(3600), move || {
            std::thread::sleep(Duration::from_millis(50));
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    assert!(rebuilder.trigger());
    assert!(!rebuilder.trigger(), "second trigger joins the running build");
    assert!(rebuilder.wait_idle(Duration::from_secs(5)).unwrap());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(rebuilder.is_fresh());

    // Fresh snapshots are not rebuilt on trigger, but force always runs.
    assert!(!rebuilder.trigger());
    rebuilder.force().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn guarded_tasks_turn_panics_into_errors() {
    let res = task::run_guarded("boom", || -> u32 { panic!("exploded") });
    match res {
        Err(StoreError::Internal(msg)) => assert!(msg.contains("exploded")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(task::run_guarded("fine", || 7).unwrap(), 7);

    let handle = task::spawn_guarded("bg-boom", || panic!("in background")).unwrap();
    assert!(handle.join().is_ok(), "panic is caught inside the thread");
}

#[test]
fn config_file_maps_to_options() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("store.toml");
    fs::write(
        &path,
        "base_dir = \"/srv/prompts\"\nfts_enabled = false\nsoft_delete_grace_secs = 60\n",
    )
    .unwrap();
    let config = StoreConfig::load(&path).unwrap();
    assert_eq!(config.base_dir.as_deref(), Some(std::path::Path::new("/srv/prompts")));
    let options = config.into_options();
    assert!(!options.fts_enabled);
    assert_eq!(options.soft_delete_grace, Duration::from_secs(60));

    fs::write(&path, "unknown_key = 1\n").unwrap();
    assert!(matches!(StoreConfig::load(&path), Err(StoreError::Config(_))));
}

#[test]
fn asset_trees_agree_on_the_shipped_prompts() {
    let embedded = EmbeddedTree::<PromptAssets>::new();
    let on_disk = DirTree::new(concat!(env!("CARGO_MANIFEST_DIR"), "/builtin/prompts"));
    assert_eq!(embedded.list().unwrap(), on_disk.list().unwrap());
    assert_eq!(
        embedded.read("bundles.json").unwrap(),
        on_disk.read("bundles.json").unwrap()
    );

    let memory = MemoryTree::new().with_file("b/x.json", "{}");
    assert_eq!(memory.list().unwrap(), vec!["b/x.json".to_string()]);
    assert!(memory.read("b/missing.json").is_err());
    assert!(on_disk.read("../Cargo.toml").is_err());
}
