use notify::{EventKind, RecommendedWatcher, RecursiveMode, event::ModifyKind};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache};
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct CategoryShared
{
    updated_paths: Mutex<Vec<PathBuf>>,
}
impl CategoryShared
{
    fn push_update(&self, path: &Path)
    {
        let mut updated = self.updated_paths.lock();
        if !updated.iter().any(|p| p == path)
        {
            updated.push(path.to_path_buf());
        }
    }
}

// One consumer's view of file changes under the watch root. Changes accumulate
// until the consumer reads and clears them, once per poll
#[derive(Clone)]
pub struct HotReloadCategory
{
    shared: Arc<CategoryShared>,
}
impl HotReloadCategory
{
    #[must_use]
    pub fn has_changes(&self) -> bool
    {
        !self.shared.updated_paths.lock().is_empty()
    }

    // snapshot-consistent read of the accumulated changes; updates arriving
    // while the guard is held are queued behind it
    #[must_use]
    pub fn begin_read(&self) -> ChangeRead<'_>
    {
        ChangeRead { guard: self.shared.updated_paths.lock() }
    }
}

pub struct ChangeRead<'a>
{
    guard: MutexGuard<'a, Vec<PathBuf>>,
}
impl ChangeRead<'_>
{
    #[must_use]
    pub fn paths(&self) -> &[PathBuf]
    {
        &self.guard
    }

    pub fn clear(&mut self)
    {
        self.guard.clear();
    }
}

// Watches a directory tree and fans debounced data-modification events out to
// every registered category as paths relative to the root
pub struct HotReloadWatcher
{
    categories: Arc<Mutex<Vec<Arc<CategoryShared>>>>,
    // kept alive for the watch duration; None when fs watching failed to start
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}
impl HotReloadWatcher
{
    #[must_use]
    pub fn new(root: &Path) -> Self
    {
        let categories: Arc<Mutex<Vec<Arc<CategoryShared>>>> = Arc::default();
        let debouncer = Self::try_fs_watch(root, categories.clone()).inspect_err(|err|
        {
            log::error!("Failed to start fs watcher for hot-reloading, continuing without: {err:?}");
        }).ok();

        Self { categories, debouncer }
    }

    fn try_fs_watch(root: &Path, categories: Arc<Mutex<Vec<Arc<CategoryShared>>>>)
        -> notify::Result<Debouncer<RecommendedWatcher, RecommendedCache>>
    {
        // events report absolute paths; compare against an absolute root
        let abs_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        let mut fs_watcher = notify_debouncer_full::new_debouncer(
            DEBOUNCE_WINDOW,
            None,
            move |evt: DebounceEventResult|
            {
                match evt
                {
                    Ok(events) =>
                    {
                        for event in events
                        {
                            let EventKind::Modify(m) = event.kind else { continue; };
                            let ModifyKind::Data(_) = m else { continue; };
                            if event.paths.is_empty() { continue; }

                            // todo: track renames so moved files invalidate their old path
                            let changed = event.paths[0].as_path();
                            let relative = changed.strip_prefix(&abs_root).unwrap_or(changed);
                            for category in categories.lock().iter()
                            {
                                category.push_update(relative);
                            }
                        }
                    },
                    Err(e) => log::error!("FS watch error: {:?}", e),
                }
            })?;

        fs_watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(fs_watcher)
    }

    #[must_use]
    pub fn is_watching(&self) -> bool
    {
        self.debouncer.is_some()
    }

    #[must_use]
    pub fn register_category(&self) -> HotReloadCategory
    {
        let shared = Arc::new(CategoryShared::default());
        self.categories.lock().push(shared.clone());
        HotReloadCategory { shared }
    }

    // inject a change directly, bypassing the fs watcher (tools and tests)
    pub fn push_path_update(&self, path: &Path)
    {
        for category in self.categories.lock().iter()
        {
            category.push_update(path);
        }
    }
}
