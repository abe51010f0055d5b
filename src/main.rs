// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused,
    unused_lifetimes,
    unused_qualifications,
    unused_results,
    anonymous_parameters,
    deprecated_in_future,
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    keyword_idents,
    macro_use_extern_crate,
    missing_doc_code_examples,
    private_doc_tests,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::unseparated_literal_suffix,
    clippy::decimal_literal_representation,
    clippy::single_char_lifetime_names,
    clippy::pattern_type_mismatch,
    clippy::fallible_impl_from,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::wildcard_enum_match_arm,
    clippy::deref_by_slicing,
    clippy::default_numeric_fallback,
    clippy::shadow_reuse,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::string_add,
    clippy::use_debug,
    clippy::future_not_send
)]
#![cfg_attr(not(test), warn(clippy::panic_in_result_fn))]

mod challenge;
mod config;
mod connection;
mod error;
mod keycontainer;
mod message;
mod metadata;
mod model;
mod rng;
mod server;
mod srp;
mod storage;
mod ui;

use std::{process, sync::Arc};

use clap::Parser;
use config::{Config, Persistence};
use error::Result;
use keycontainer::KeyContainerStore;
use log::{error, warn};
use storage::{File, Memory, OsSeal};
use ui::ConsoleUiHost;

/// The concrete `ConfigStore` implementation varies by `--persistence`;
/// `OsSeal` (when available) layers on top of either one as the Tier 2
/// sealing backend.
enum KeyContainerStoreImpl {
    Memory(KeyContainerStore<Memory, OsSeal>),
    File(KeyContainerStore<File, OsSeal>),
}

/// Builds the key container store for the persistence backend the user
/// selected. A failure to open the OS-sealing backend never aborts
/// startup: it only means [`keycontainer::KeyContainerStore::persist`]
/// degrades Tier 2 writes to plaintext at the moment they happen, with a
/// logged warning each time.
async fn build_store(config: &Config) -> KeyContainerStoreImpl {
    let seal = match config.persistence {
        Persistence::Memory | Persistence::File => None,
        Persistence::OsSeal => match OsSeal::new().await {
            Ok(seal) => Some(seal),
            Err(e) => {
                warn!("OS-backed secret store unavailable ({e}); Tier 2 persistence will degrade to plaintext");
                None
            }
        },
    };

    match config.persistence {
        Persistence::Memory => KeyContainerStoreImpl::Memory(KeyContainerStore::new(Memory::new(), seal)),
        // Sealing a blob only for it to live in a process-lifetime config
        // bag would defeat the point of persisting it across restarts at
        // all, so `OsSeal` reuses the same on-disk config bag as `File`
        // and layers the OS secret-store wrapping key on top of it.
        Persistence::File | Persistence::OsSeal => {
            let dir = config.config_dir.clone().unwrap_or_else(|| {
                metadata::PROJECT_DIRS
                    .as_ref()
                    .map_or_else(|| std::path::PathBuf::from("."), |d| d.config_dir().to_owned())
            });
            KeyContainerStoreImpl::File(KeyContainerStore::new(File::new(dir.join("config.json")), seal))
        }
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl-C handler: {e}");
        std::future::pending::<()>().await;
    }
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let ui = Arc::new(ConsoleUiHost::new());

    match build_store(&config).await {
        KeyContainerStoreImpl::Memory(store) => {
            server::Server::new(Arc::clone(&config), Arc::new(store), ui)
                .serve(wait_for_ctrl_c())
                .await
        }
        KeyContainerStoreImpl::File(store) => {
            server::Server::new(Arc::clone(&config), Arc::new(store), ui)
                .serve(wait_for_ctrl_c())
                .await
        }
    }
}

#[tokio::main]
async fn main() {
    let logger_env = env_logger::Env::new()
        .filter_or("KEEPASSRPC_LOG", "info")
        .write_style("KEEPASSRPC_LOG_STYLE");
    env_logger::Builder::from_env(logger_env).init();

    if let Err(e) = run(Config::parse()).await {
        error!("we encountered an error: {e}");
        process::exit(1);
    }
}
