//! bundlestore: a versioned, bundle-oriented JSON content store.
//!
//! Items (prompt templates, tool specifications, ...) live in bundles. Each
//! item version is one immutable JSON file under its bundle's directory.
//! Bundles shipped with the binary are read-only apart from their enabled
//! flags, which persist in an overlay file. An optional SQLite FTS5 index
//! serves ranked search across built-in and user items.
//!
//! # Layout under `base_dir`
//!
//! ```text
//! bundles_meta.json              user bundle records
//! builtin_overlay.json           enabled flags of built-in bundles and items
//! search.sqlite                  FTS5 index (when enabled)
//! <bundle-id>_<slug>/            one directory per user bundle
//!     <slug>_<version>.json      one file per item version
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bundlestore::{BundleStore, PutBundleRequest, StoreOptions};
//! use bundlestore::plugins::Prompts;
//!
//! let store: BundleStore<Prompts> = BundleStore::open("/tmp/prompts", StoreOptions::default())?;
//! store.put_bundle("team", PutBundleRequest {
//!     slug: "team".into(),
//!     display_name: "Team prompts".into(),
//!     description: None,
//!     is_enabled: true,
//! })?;
//! # Ok::<(), bundlestore::StoreError>(())
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage building blocks (map files, partitioned dirs, FTS, overlay, built-ins)
//! - [`store`]: the [`BundleStore`] façade, generic over an item domain
//! - [`plugins`]: the [`plugins::ItemDomain`] trait and the prompt and tool domains

mod cli;
pub mod core;
pub mod plugins;
pub mod store;

pub use crate::core::config::{StoreConfig, StoreOptions};
pub use crate::core::error::{Result, StoreError};
pub use crate::core::model::{
    AllBundles, Bundle, Item, ItemListEntry, ListBundlesRequest, ListBundlesResponse,
    ListItemsRequest, ListItemsResponse, PutBundleRequest, PutItemRequest, SearchHit,
    SearchItemsRequest, SearchItemsResponse,
};
pub use store::{BundleStore, ReindexStats};

use anyhow::{Context, bail};
use clap::Parser;
use cli::{BundleCommand, Cli, Command, Domain, ItemCommand, PageArgs};
use plugins::{ItemDomain, Prompts, Tools};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Entry point of the `bundlestore` binary.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (base_dir, mut options) = resolve_options(&cli)?;
    if cli.no_fts {
        options.fts_enabled = false;
    }
    match cli.domain {
        Domain::Prompts => dispatch(BundleStore::<Prompts>::open(base_dir, options)?, cli.command),
        Domain::Tools => dispatch(BundleStore::<Tools>::open(base_dir, options)?, cli.command),
    }
}

fn resolve_options(cli: &Cli) -> anyhow::Result<(PathBuf, StoreOptions)> {
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let base_dir = match (cli.base_dir.clone(), config.base_dir.clone()) {
        (Some(dir), _) | (None, Some(dir)) => dir,
        (None, None) => bail!("no store directory: pass --base-dir or set base_dir in --config"),
    };
    Ok((base_dir, config.into_options()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_body(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading item body from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading item body {}", path.display()))
}

fn dispatch<D: ItemDomain>(store: BundleStore<D>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Bundle(bundle) => match bundle.command {
            BundleCommand::Put {
                id,
                slug,
                display_name,
                description,
                disabled,
            } => print_json(&store.put_bundle(
                &id,
                PutBundleRequest {
                    slug,
                    display_name,
                    description,
                    is_enabled: !disabled,
                },
            )?)?,
            BundleCommand::Patch { id, enabled } => print_json(&store.patch_bundle(&id, enabled)?)?,
            BundleCommand::Get { id } => print_json(&store.get_bundle(&id)?)?,
            BundleCommand::Delete { id } => {
                store.delete_bundle(&id)?;
                print_json(&serde_json::json!({ "deleted": id }))?
            }
            BundleCommand::List { page, bundle_ids } => {
                let PageArgs {
                    page_size,
                    page_token,
                    include_disabled,
                } = page;
                print_json(&store.list_bundles(ListBundlesRequest {
                    page_size,
                    page_token,
                    include_disabled,
                    bundle_ids,
                })?)?
            }
        },
        Command::Item(item) => match item.command {
            ItemCommand::Put { item, file } => {
                let body: PutItemRequest<D::Payload> = serde_json::from_str(&read_body(&file)?)
                    .with_context(|| format!("parsing item body {}", file.display()))?;
                print_json(&store.put_item(&item.bundle_id, &item.slug, &item.version, body)?)?
            }
            ItemCommand::Patch { item, enabled } => print_json(&store.patch_item(
                &item.bundle_id,
                &item.slug,
                &item.version,
                enabled,
            )?)?,
            ItemCommand::Get { item } => {
                print_json(&store.get_item(&item.bundle_id, &item.slug, &item.version)?)?
            }
            ItemCommand::Delete { item } => {
                store.delete_item(&item.bundle_id, &item.slug, &item.version)?;
                print_json(&serde_json::json!({
                    "deleted": { "bundleID": item.bundle_id, "slug": item.slug, "version": item.version }
                }))?
            }
            ItemCommand::List {
                page,
                all_versions,
                bundle_ids,
                tags,
            } => print_json(&store.list_items(ListItemsRequest {
                page_size: page.page_size,
                page_token: page.page_token,
                include_disabled: page.include_disabled,
                all_versions,
                bundle_ids,
                tags,
            })?)?,
            ItemCommand::Search { query, page } => {
                store.wait_for_index()?;
                print_json(&store.search_items(SearchItemsRequest {
                    query,
                    page_size: page.page_size,
                    page_token: page.page_token,
                    include_disabled: page.include_disabled,
                })?)?
            }
        },
        Command::Sweep => print_json(&serde_json::json!({ "removed": store.sweep_now()? }))?,
        Command::Reindex => {
            let stats = store.reindex()?;
            print_json(&serde_json::json!({ "stats": stats, "rows": store.index_stats()? }))?
        }
    }
    store.close()?;
    Ok(())
}
