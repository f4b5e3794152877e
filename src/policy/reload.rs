use std::path::Path;
use std::sync::Arc;

use notify::{Event, RecursiveMode, Watcher};

use super::PolicyEngine;

/// Watches the policy file's parent directory (not the file itself — a
/// directory watch catches the rename-and-replace pattern most editors and
/// config-management tools use, which a direct file watch misses; spec §9)
/// and triggers `PolicyEngine::reload` on any change inside it.
pub fn spawn_watcher(engine: Arc<PolicyEngine>, policy_file: String) -> anyhow::Result<()> {
    let path = Path::new(&policy_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| Path::new(".").to_path_buf());
    let file_name = path.file_name().map(|f| f.to_os_string());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        while let Some(event) = rx.recv().await {
            let relevant = match &file_name {
                Some(name) => event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str())),
                None => true,
            };
            if !relevant {
                continue;
            }
            match engine.reload() {
                Ok(count) => tracing::info!(count, "policy hot reload succeeded"),
                Err(e) => tracing::error!(error = %e, "policy hot reload failed, keeping previous snapshot"),
            }
        }
    });

    Ok(())
}
