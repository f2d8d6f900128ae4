use super::*;
use std::sync::atomic::{AtomicU8, Ordering};

pub const RESOURCE_FILE_EXTENSION: &str = "res";

// Where a load lands in the executor's queue relative to everything else in flight
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourcePriority
{
    Background = 0, // scenery models, textures, distant level chunks
    Foreground = 1, // hud models, cutscene content
    Highest = 2,    // gameplay-critical config data
}
impl ResourcePriority
{
    #[inline] #[must_use]
    pub(crate) fn task_priority(self) -> i32 { self as i32 }
}

// Lifecycle of one cached instance:
//   Loading -> Loaded|Failed   (one-shot, by the load task)
//   Loaded|Failed -> Unloaded  (by garbage collection)
//   Unloaded -> Loading        (only via get_or_load restarting a collected entry)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState
{
    Loading = 0,
    Loaded = 1,
    Failed = 2,
    Unloaded = 3,
}
impl LoadState
{
    #[inline] #[must_use]
    fn from_u8(value: u8) -> Self
    {
        match value
        {
            0 => Self::Loading,
            1 => Self::Loaded,
            2 => Self::Failed,
            _ => Self::Unloaded,
        }
    }
}

pub(crate) struct AtomicLoadState(AtomicU8);
impl AtomicLoadState
{
    #[inline] #[must_use]
    pub fn new(state: LoadState) -> Self { Self(AtomicU8::new(state as u8)) }

    #[inline] #[must_use]
    pub fn load(&self) -> LoadState { LoadState::from_u8(self.0.load(Ordering::Acquire)) }

    #[inline]
    pub fn store(&self, state: LoadState) { self.0.store(state as u8, Ordering::Release); }

    #[inline]
    pub fn compare_exchange(&self, current: LoadState, new: LoadState) -> Result<LoadState, LoadState>
    {
        self.0.compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(LoadState::from_u8)
            .map_err(LoadState::from_u8)
    }
}

// The contract every cached payload type implements. Loading lives on the
// matching ResourceLoader; these hooks cover validity, unload, and hot reload
pub trait Resource: Send + Sync + 'static
{
    fn resource_type() -> ResourceTypeId;

    // payload-level validity; only meaningful once the owning instance is ready
    fn is_valid(&self) -> bool { true }

    // called at most once, by garbage collection, before the payload is dropped
    fn on_release(&self) { }

    fn supports_hot_reload() -> bool { false }
    // called around a reload, never concurrently with a load task
    fn on_reload_begin(&self) { }
    fn on_reload_complete(&self) { }
}
