//! CLI struct definitions for the `bundlestore` operator binary.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "bundlestore",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect and edit a bundle store directory. Every command prints JSON."
)]
pub(crate) struct Cli {
    /// Store directory. Overrides `base_dir` from the config file.
    #[clap(long, global = true)]
    pub base_dir: Option<PathBuf>,
    /// TOML config file.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Item domain the directory holds.
    #[clap(long, global = true, value_enum, default_value = "prompts")]
    pub domain: Domain,
    /// Open the store without the search index.
    #[clap(long, global = true)]
    pub no_fts: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Domain {
    Prompts,
    Tools,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Bundle records
    Bundle(BundleCli),
    /// Items inside bundles
    Item(ItemCli),
    /// Hard-delete soft-deleted bundles past their grace period
    Sweep,
    /// Reconcile the search index with disk and the built-ins
    Reindex,
}

#[derive(clap::Args, Debug)]
pub(crate) struct BundleCli {
    #[clap(subcommand)]
    pub command: BundleCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BundleCommand {
    /// Create or replace a user bundle
    Put {
        id: String,
        #[clap(long)]
        slug: String,
        #[clap(long)]
        display_name: String,
        #[clap(long)]
        description: Option<String>,
        /// Create the bundle disabled
        #[clap(long)]
        disabled: bool,
    },
    /// Enable or disable a bundle
    Patch {
        id: String,
        #[clap(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Get {
        id: String,
    },
    /// Soft-delete an empty bundle
    Delete {
        id: String,
    },
    List {
        #[clap(flatten)]
        page: PageArgs,
        /// Restrict to these bundle ids (repeatable)
        #[clap(long = "bundle-id")]
        bundle_ids: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ItemCli {
    #[clap(subcommand)]
    pub command: ItemCommand,
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct ItemRef {
    pub bundle_id: String,
    pub slug: String,
    pub version: String,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub(crate) struct PageArgs {
    #[clap(long, default_value_t = 0)]
    pub page_size: usize,
    #[clap(long)]
    pub page_token: Option<String>,
    #[clap(long)]
    pub include_disabled: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ItemCommand {
    /// Write a new item version from a JSON body (`-` reads stdin)
    Put {
        #[clap(flatten)]
        item: ItemRef,
        #[clap(long)]
        file: PathBuf,
    },
    /// Enable or disable an item version
    Patch {
        #[clap(flatten)]
        item: ItemRef,
        #[clap(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Get {
        #[clap(flatten)]
        item: ItemRef,
    },
    Delete {
        #[clap(flatten)]
        item: ItemRef,
    },
    List {
        #[clap(flatten)]
        page: PageArgs,
        /// List every version instead of the newest per slug
        #[clap(long)]
        all_versions: bool,
        #[clap(long = "bundle-id")]
        bundle_ids: Vec<String>,
        /// Only items carrying every given tag (repeatable)
        #[clap(long = "tag")]
        tags: Vec<String>,
    },
    /// Full-text search
    Search {
        query: String,
        #[clap(flatten)]
        page: PageArgs,
    },
}
