use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{error, info};
use notify::{RecursiveMode, Watcher};

use crate::policy::PolicyStore;

/// Watches the policy files and swaps the shared store in place when any
/// of them change. A broken edit keeps the previous store.
pub fn spawn_reload(paths: Vec<PathBuf>, shared: Arc<RwLock<PolicyStore>>) {
    if paths.is_empty() {
        return;
    }

    std::thread::spawn(move || {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("Config watcher unavailable: {e}");

                return;
            }
        };

        for path in &paths {
            if let Err(e) = watcher.watch(Path::new(path), RecursiveMode::NonRecursive) {
                error!("Cannot watch {path:?}: {e}");
            }
        }

        for event in rx {
            match event {
                Ok(_) => match PolicyStore::load(&paths) {
                    Ok(fresh) => {
                        *shared.write().unwrap() = fresh;

                        info!("Policy configuration hot-reloaded");
                    }

                    Err(e) => error!("Keeping the old policy set, reload failed: {e:#}"),
                },

                Err(e) => error!("Error while watching the config files: {e:?}"),
            }
        }
    });
}
