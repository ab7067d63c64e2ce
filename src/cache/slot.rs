//! A single cached value with its readiness signal.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::CachedData;

struct SlotState<T> {
    /// Value cached this frame
    value: Option<T>,
    /// Manual-reset readiness signal
    signaled: bool,
}

/// Cached value plus readiness signal, reset together under one lock so a
/// reader never sees a flag from one frame and a value from another.
pub struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                signaled: false,
            }),
            ready: Condvar::new(),
        }
    }
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Cached value. Only meaningful after `is_cached` returned true this frame.
    pub fn load(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Store the value and wake every waiter
    pub fn save(&self, value: T) {
        let mut state = self.state.lock();
        state.value = Some(value);
        state.signaled = true;
        self.ready.notify_all();
    }

    /// Block until the slot is signaled, then copy the value out.
    ///
    /// A forced release wakes the caller with whatever is cached, possibly
    /// nothing.
    pub fn wait_load(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.signaled {
            self.ready.wait(&mut state);
        }
        state.value.clone()
    }

    /// Same as `wait_load` with an upper bound. `None` on timeout or when
    /// released empty.
    pub fn wait_load_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.signaled {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
        state.value.clone()
    }

    /// Produce and save a value under the slot lock unless one is already
    /// cached. Returns true if `produce` ran.
    pub fn fill_with(&self, produce: impl FnOnce() -> T) -> bool {
        let mut state = self.state.lock();
        if state.value.is_some() {
            return false;
        }
        state.value = Some(produce());
        state.signaled = true;
        self.ready.notify_all();
        true
    }

    /// Drop the value and clear the signal
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.value = None;
        state.signaled = false;
    }

    /// Signal without a value so blocked readers return
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.ready.notify_all();
    }
}

/// Conversion between a slot's concrete type and the tagged cache value
pub trait CacheValue: Clone + Send + Sized {
    fn into_data(self) -> CachedData;

    fn from_data(data: CachedData) -> Option<Self>;
}

/// Kind-erased view of a slot, selected by `CacheKey`
pub trait DataSlot: Send + Sync {
    fn is_cached(&self) -> bool;

    fn load_data(&self) -> Option<CachedData>;

    /// Returns false if `data` belongs to another kind of slot
    fn save_data(&self, data: CachedData) -> bool;

    fn reset(&self);

    fn release(&self);
}

impl<T: CacheValue> DataSlot for Slot<T> {
    fn is_cached(&self) -> bool {
        Slot::is_cached(self)
    }

    fn load_data(&self) -> Option<CachedData> {
        self.load().map(CacheValue::into_data)
    }

    fn save_data(&self, data: CachedData) -> bool {
        match T::from_data(data) {
            Some(value) => {
                self.save(value);
                true
            }
            None => false,
        }
    }

    fn reset(&self) {
        Slot::reset(self)
    }

    fn release(&self) {
        Slot::release(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_save_then_load() {
        let slot: Slot<u32> = Slot::new();
        assert!(!slot.is_cached());
        slot.save(7);
        assert!(slot.is_cached());
        assert_eq!(slot.load(), Some(7));
        assert_eq!(slot.wait_load(), Some(7));
    }

    #[test]
    fn test_waiter_wakes_on_save() {
        let slot: Arc<Slot<String>> = Arc::new(Slot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_load())
        };

        thread::sleep(Duration::from_millis(20));
        slot.save("frame-1".to_string());
        assert_eq!(reader.join().unwrap().as_deref(), Some("frame-1"));
    }

    #[test]
    fn test_fill_with_runs_once_per_frame() {
        let slot: Slot<u32> = Slot::new();
        assert!(slot.fill_with(|| 1));
        assert!(!slot.fill_with(|| 2));
        assert_eq!(slot.load(), Some(1));

        slot.reset();
        assert!(slot.fill_with(|| 3));
        assert_eq!(slot.load(), Some(3));
    }

    #[test]
    fn test_reset_clears_flag_and_signal() {
        let slot: Slot<u32> = Slot::new();
        slot.save(1);
        slot.reset();
        assert!(!slot.is_cached());
        assert_eq!(slot.wait_load_for(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_release_unblocks_empty() {
        let slot: Arc<Slot<u32>> = Arc::new(Slot::new());
        let reader = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_load())
        };

        thread::sleep(Duration::from_millis(20));
        slot.release();
        assert_eq!(reader.join().unwrap(), None);
    }
}
