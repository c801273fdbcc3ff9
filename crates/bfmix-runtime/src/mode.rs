//! Thread-local stack of precision mode frames.
//!
//! Only the top frame is effective. Frames are pushed by [`enter`] and its
//! variants and popped when the returned [`ModeGuard`] is dropped. Guards
//! must be released in reverse order of creation.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use bfmix_core::ExecutionMode;

use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeContext {
    pub engine_enabled: bool,
    pub auto_mix_enabled: bool,
    pub mode: ExecutionMode,
}

impl ModeContext {
    pub const DISABLED: Self = Self {
        engine_enabled: false,
        auto_mix_enabled: false,
        mode: ExecutionMode::Inference,
    };

    #[must_use]
    pub const fn auto_mix_active(&self) -> bool {
        self.engine_enabled && self.auto_mix_enabled
    }

    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.mode.is_training()
    }
}

/// Identity of one pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken {
    pub depth: usize,
    pub serial: u64,
}

#[derive(Debug, Clone, Copy)]
struct ModeFrame {
    ctx: ModeContext,
    serial: u64,
}

thread_local! {
    static MODE_STACK: RefCell<Vec<ModeFrame>> = const { RefCell::new(Vec::new()) };
    static BASE_OVERRIDE: Cell<Option<ModeContext>> = const { Cell::new(None) };
    static NEXT_SERIAL: Cell<u64> = const { Cell::new(1) };
}

/// RAII handle of a pushed frame. Not `Send`: the frame lives on the stack
/// of the thread that created it.
#[derive(Debug)]
#[must_use = "dropping the guard immediately pops the frame"]
pub struct ModeGuard {
    token: ScopeToken,
    _thread_bound: PhantomData<*const ()>,
}

impl ModeGuard {
    #[must_use]
    pub fn token(&self) -> ScopeToken {
        self.token
    }

    #[must_use]
    pub fn context(&self) -> ModeContext {
        MODE_STACK.with(|stack| {
            stack
                .borrow()
                .get(self.token.depth - 1)
                .map_or_else(base_mode, |frame| frame.ctx)
        })
    }

    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        let popped = MODE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if top.serial == self.token.serial => stack.pop().is_some(),
                _ => false,
            }
        });
        if !popped {
            let depth = depth();
            panic!(
                "mode stack imbalance: scope {} (depth {}) exited while depth is {depth}",
                self.token.serial, self.token.depth
            );
        }
        tracing::trace!(
            target: "bfmix::mode",
            serial = self.token.serial,
            depth = self.token.depth - 1,
            "mode frame popped"
        );
    }
}

/// Pushes a fully specified frame.
pub fn enter(engine_enabled: bool, auto_mix_enabled: bool, train: bool) -> ModeGuard {
    push(ModeContext {
        engine_enabled,
        auto_mix_enabled,
        mode: ExecutionMode::from_train(train),
    })
}

/// Toggles the engine, inheriting auto-mix and the train flag.
pub fn enter_engine(enabled: bool) -> ModeGuard {
    let top = current();
    push(ModeContext {
        engine_enabled: enabled,
        ..top
    })
}

/// Toggles auto-mix and sets the train flag, inheriting the engine flag.
pub fn enter_auto_mix(enabled: bool, train: bool) -> ModeGuard {
    let top = current();
    push(ModeContext {
        engine_enabled: top.engine_enabled,
        auto_mix_enabled: enabled,
        mode: ExecutionMode::from_train(train),
    })
}

pub fn push(ctx: ModeContext) -> ModeGuard {
    let serial = NEXT_SERIAL.with(|next| {
        let serial = next.get();
        next.set(serial.wrapping_add(1));
        serial
    });
    let depth = MODE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(ModeFrame { ctx, serial });
        stack.len()
    });
    tracing::trace!(
        target: "bfmix::mode",
        serial,
        depth,
        engine = ctx.engine_enabled,
        auto_mix = ctx.auto_mix_enabled,
        train = ctx.is_training(),
        "mode frame pushed"
    );
    ModeGuard {
        token: ScopeToken { depth, serial },
        _thread_bound: PhantomData,
    }
}

/// Effective context: the top frame, or the base frame when nothing is pushed.
#[must_use]
pub fn current() -> ModeContext {
    MODE_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map_or_else(base_mode, |frame| frame.ctx)
    })
}

/// Number of frames pushed above the base frame.
#[must_use]
pub fn depth() -> usize {
    MODE_STACK.with(|stack| stack.borrow().len())
}

#[must_use]
pub fn base_mode() -> ModeContext {
    BASE_OVERRIDE
        .with(Cell::get)
        .unwrap_or_else(|| Settings::global().base_mode())
}

/// Replaces this thread's base frame and returns the previous one.
pub fn set_base_mode(ctx: ModeContext) -> ModeContext {
    let previous = base_mode();
    BASE_OVERRIDE.with(|base| base.set(Some(ctx)));
    tracing::debug!(
        target: "bfmix::mode",
        engine = ctx.engine_enabled,
        auto_mix = ctx.auto_mix_enabled,
        train = ctx.is_training(),
        "base mode replaced"
    );
    previous
}

/// Restores the environment-derived base frame.
pub fn reset_base_mode() {
    BASE_OVERRIDE.with(|base| base.set(None));
}

pub fn with_mode<R>(ctx: ModeContext, f: impl FnOnce() -> R) -> R {
    let _guard = push(ctx);
    f()
}

#[cfg(test)]
mod tests {
    use bfmix_core::ExecutionMode;
    use proptest::prelude::*;

    use super::{
        ModeContext, base_mode, current, depth, enter, enter_auto_mix, enter_engine,
        reset_base_mode, set_base_mode, with_mode,
    };

    #[test]
    fn empty_stack_reports_base_frame() {
        reset_base_mode();
        assert_eq!(depth(), 0);
        assert_eq!(current(), base_mode());
    }

    #[test]
    fn nested_scopes_restore_outer_frame() {
        reset_base_mode();
        let _ = set_base_mode(ModeContext::DISABLED);
        {
            let _engine = enter_engine(true);
            assert!(current().engine_enabled);
            assert!(!current().auto_mix_enabled);
            {
                let _mix = enter_auto_mix(true, true);
                let ctx = current();
                assert!(ctx.auto_mix_active());
                assert_eq!(ctx.mode, ExecutionMode::Training);
                assert_eq!(depth(), 2);
            }
            let ctx = current();
            assert!(ctx.engine_enabled);
            assert!(!ctx.auto_mix_enabled);
            assert_eq!(depth(), 1);
        }
        assert_eq!(current(), ModeContext::DISABLED);
        reset_base_mode();
    }

    #[test]
    fn auto_mix_without_engine_is_inactive() {
        let _mix = enter(false, true, false);
        assert!(!current().auto_mix_active());
    }

    #[test]
    fn engine_toggle_inherits_auto_mix_and_train() {
        let _outer = enter(false, true, true);
        let _engine = enter_engine(true);
        let ctx = current();
        assert!(ctx.auto_mix_active());
        assert!(ctx.is_training());
    }

    #[test]
    fn explicit_exit_pops_frame() {
        let guard = enter(true, true, false);
        let token = guard.token();
        assert_eq!(token.depth, depth());
        assert!(guard.context().auto_mix_active());
        guard.exit();
        assert_eq!(depth(), token.depth - 1);
    }

    #[test]
    fn with_mode_scopes_closure() {
        let inner = with_mode(
            ModeContext {
                engine_enabled: true,
                auto_mix_enabled: true,
                mode: ExecutionMode::Inference,
            },
            current,
        );
        assert!(inner.auto_mix_active());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn base_override_is_thread_local() {
        let _ = set_base_mode(ModeContext {
            engine_enabled: true,
            auto_mix_enabled: true,
            mode: ExecutionMode::Training,
        });
        let other = std::thread::spawn(|| (current(), depth()))
            .join()
            .expect("thread should finish");
        assert!(current().auto_mix_active());
        assert_eq!(other.1, 0);
        assert_eq!(other.0, base_mode_of_fresh_thread());
        reset_base_mode();
    }

    fn base_mode_of_fresh_thread() -> ModeContext {
        std::thread::spawn(base_mode)
            .join()
            .expect("thread should finish")
    }

    #[test]
    #[should_panic(expected = "mode stack imbalance")]
    fn out_of_order_exit_panics() {
        let outer = enter(true, false, false);
        let _inner = enter(true, true, false);
        outer.exit();
    }

    proptest! {
        #[test]
        fn prop_nested_guards_unwind_to_outer_frame(
            frames in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..8)
        ) {
            let before = (current(), depth());
            let mut guards = Vec::new();
            for (engine, auto_mix, train) in frames.iter().copied() {
                guards.push(enter(engine, auto_mix, train));
                prop_assert_eq!(current().engine_enabled, engine);
                prop_assert_eq!(current().auto_mix_active(), engine && auto_mix);
            }
            prop_assert_eq!(depth(), before.1 + frames.len());
            while let Some(guard) = guards.pop() {
                guard.exit();
            }
            prop_assert_eq!((current(), depth()), before);
        }
    }
}
