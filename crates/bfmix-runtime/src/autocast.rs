//! Per-device autocast state, the generic layer the accelerator `autocast`
//! wrapper forwards to.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use bfmix_core::{DType, Device, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutocastState {
    pub device: Device,
    pub enabled: bool,
    pub dtype: DType,
    pub cache_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct AutocastFrame {
    state: AutocastState,
    serial: u64,
}

/// Cache key: source tensor id, its storage version at cast time and the
/// target dtype. Views of one storage have distinct ids.
type CastKey = (u64, u64, DType);

thread_local! {
    static AUTOCAST_STACK: RefCell<Vec<AutocastFrame>> = const { RefCell::new(Vec::new()) };
    static CAST_CACHE: RefCell<HashMap<CastKey, Tensor>> = RefCell::new(HashMap::new());
    static NEXT_AUTOCAST_SERIAL: RefCell<u64> = const { RefCell::new(1) };
}

#[derive(Debug)]
#[must_use = "dropping the scope immediately restores the previous autocast state"]
pub struct AutocastScope {
    serial: u64,
    state: AutocastState,
    _thread_bound: PhantomData<*const ()>,
}

impl AutocastScope {
    #[must_use]
    pub fn state(&self) -> AutocastState {
        self.state
    }
}

impl Drop for AutocastScope {
    fn drop(&mut self) {
        let (popped, remaining) = AUTOCAST_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let popped = match stack.last() {
                Some(top) if top.serial == self.serial => stack.pop().is_some(),
                _ => false,
            };
            (popped, stack.len())
        });
        if !popped {
            panic!("autocast scope {} exited out of order", self.serial);
        }
        // Cached casts live as long as the outermost scope.
        if remaining == 0 {
            CAST_CACHE.with(|cache| cache.borrow_mut().clear());
        }
    }
}

pub fn push_autocast(
    device: Device,
    enabled: bool,
    dtype: DType,
    cache_enabled: bool,
) -> AutocastScope {
    let state = AutocastState {
        device,
        enabled,
        dtype,
        cache_enabled,
    };
    let serial = NEXT_AUTOCAST_SERIAL.with(|next| {
        let mut next = next.borrow_mut();
        let serial = *next;
        *next = serial.wrapping_add(1);
        serial
    });
    AUTOCAST_STACK.with(|stack| stack.borrow_mut().push(AutocastFrame { state, serial }));
    tracing::debug!(
        target: "bfmix::autocast",
        device = device.name(),
        enabled,
        dtype = dtype.name(),
        cache_enabled,
        "autocast scope entered"
    );
    AutocastScope {
        serial,
        state,
        _thread_bound: PhantomData,
    }
}

/// Innermost autocast state for `device`, if any scope targets it.
#[must_use]
pub fn autocast_state(device: Device) -> Option<AutocastState> {
    AUTOCAST_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.state.device == device)
            .map(|frame| frame.state)
    })
}

#[must_use]
pub fn is_autocast_enabled(device: Device) -> bool {
    autocast_state(device).is_some_and(|state| state.enabled)
}

/// Target dtype when autocast is active for `device`.
#[must_use]
pub fn autocast_target(device: Device) -> Option<DType> {
    autocast_state(device)
        .filter(|state| state.enabled)
        .map(|state| state.dtype)
}

/// Returns the cached cast of `source` to `dtype`, computing it with `cast`
/// on a miss. Tensors that require grad are cached per tensor id, and only
/// while the active scope has caching enabled. A write to the storage
/// invalidates the entry.
pub fn cached_cast<E>(
    source: &Tensor,
    dtype: DType,
    cast: impl FnOnce(&Tensor) -> Result<Tensor, E>,
) -> Result<Tensor, E> {
    let cacheable = source.requires_grad()
        && autocast_state(source.device()).is_some_and(|state| state.cache_enabled);
    if !cacheable {
        return cast(source);
    }
    let key = (source.id(), source.version(), dtype);
    if let Some(hit) = CAST_CACHE.with(|cache| cache.borrow().get(&key).cloned()) {
        return Ok(hit);
    }
    let fresh = cast(source)?;
    CAST_CACHE.with(|cache| cache.borrow_mut().insert(key, fresh.clone()));
    Ok(fresh)
}

#[must_use]
pub fn cached_cast_count() -> usize {
    CAST_CACHE.with(|cache| cache.borrow().len())
}
