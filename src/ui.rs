// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;

/// The capability boundary this crate depends on for anything that must
/// run on the host UI framework's single thread: displaying the visual
/// password during first pairing, and (per the host's own save
/// discipline) serializing writes to the process-wide config bag.
///
/// This crate never talks to a specific GUI toolkit directly; a host
/// embeds it by implementing this trait and wiring `post` to whatever
/// "run this on the UI thread" primitive its framework provides.
#[async_trait]
pub(crate) trait UiHost: Send + Sync {
    /// Schedules `task` to run on the UI thread and returns without
    /// waiting for it. Never call this from inside an I/O task and then
    /// block on its completion: that is exactly the deadlock this
    /// indirection exists to avoid.
    fn post(&self, task: Box<dyn FnOnce() + Send>);

    /// Displays the one-time visual password to the user during first
    /// pairing, alongside the identity the connecting client claims for
    /// itself. Purely informational: the core does not wait for a
    /// confirmation outcome to proceed, because the client has already
    /// committed to the value by the time this fires.
    async fn display_pairing(
        &self,
        client_display_name: Option<&str>,
        client_display_description: Option<&str>,
        visual_password: &str,
    );

    /// Warns the user that a stored key matched the known exploit marker
    /// and was refused.
    async fn warn_exploit_marker(&self, username: &str);
}

/// A `UiHost` for running the daemon standalone, without an embedding
/// desktop application. `post` jobs are drained serially by one
/// background task, which stands in for "the UI thread" the way a real
/// embedder's single-threaded event loop would.
pub(crate) struct ConsoleUiHost {
    tx: mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl ConsoleUiHost {
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
        let _ = tokio::task::spawn_blocking(move || {
            while let Some(task) = rx.blocking_recv() {
                task();
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl UiHost for ConsoleUiHost {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        if self.tx.send(task).is_err() {
            log::warn!("UI host thread has shut down; dropping posted task");
        }
    }

    async fn display_pairing(
        &self,
        client_display_name: Option<&str>,
        client_display_description: Option<&str>,
        visual_password: &str,
    ) {
        let name = client_display_name.unwrap_or("an unnamed client").to_owned();
        let description = client_display_description.map(str::to_owned);
        let password = visual_password.to_owned();
        self.post(Box::new(move || {
            info!(
                "Pairing request from {name}{}: type this code into the client: {password}",
                description.map(|d| format!(" ({d})")).unwrap_or_default()
            );
        }));
    }

    async fn warn_exploit_marker(&self, username: &str) {
        let username = username.to_owned();
        self.post(Box::new(move || {
            log::warn!(
                "stored key for \"{username}\" matches a known exploit marker and was refused; the client must re-pair"
            );
        }));
    }
}
