// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Watches the domain list for changes.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Starts watching the domain list at `path`. Whenever the file is
/// created, modified, or removed, `on_change` is called from the
/// watcher's thread. The returned watcher must be kept alive for as
/// long as notifications are wanted.
///
/// The directory containing the file is watched rather than the file
/// itself, since editors often replace a file instead of writing it in
/// place, and a watch on the file would not survive that.
pub fn watch<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let file_name = path.file_name().map(OsString::from);
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if is_relevant(&event, file_name.as_deref()) {
                    on_change();
                }
            }
        },
        Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Starts watching the domain list at `path`, sending `event` on
/// `sender` when it changes. If the channel is full, the notification
/// is dropped: a reload is already queued.
pub fn watch_with_channel<T>(
    path: &Path,
    sender: mpsc::Sender<T>,
    event: T,
) -> notify::Result<RecommendedWatcher>
where
    T: Clone + Send + 'static,
{
    watch(path, move || {
        let _ = sender.try_send(event.clone());
    })
}

/// Returns whether `event` changes the file named `file_name`.
fn is_relevant(event: &Event, file_name: Option<&OsStr>) -> bool {
    if !matches!(
        event.kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name().is_some() && p.file_name() == file_name)
}
