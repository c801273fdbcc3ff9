#![forbid(unsafe_code)]

pub mod autocast;
pub mod mode;
pub mod settings;

use std::fmt;

pub use autocast::{
    AutocastScope, AutocastState, autocast_state, autocast_target, cached_cast,
    is_autocast_enabled, push_autocast,
};
pub use mode::{
    ModeContext, ModeGuard, ScopeToken, base_mode, current, depth, enter, enter_auto_mix,
    enter_engine, reset_base_mode, set_base_mode, with_mode,
};
pub use settings::{Settings, SettingsBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Dispatch,
    Backward,
    Policy,
    Reorder,
    Durability,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settings plus the evidence ledger of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    settings: Settings,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let mut ledger = EvidenceLedger::new();
        let base = settings.base_mode();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "base mode engine={} auto_mix={} mode={:?}",
                base.engine_enabled, base.auto_mix_enabled, base.mode
            ),
        );
        Self { settings, ledger }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Reorder events are only kept when verbose logging is requested.
    #[must_use]
    pub fn records_reorders(&self) -> bool {
        self.settings.verbose_level() > 0
    }

    pub fn record_mode_change(&mut self, ctx: ModeContext) {
        self.ledger.record(
            EvidenceKind::Policy,
            format!(
                "mode switched engine={} auto_mix={} mode={:?}",
                ctx.engine_enabled, ctx.auto_mix_enabled, ctx.mode
            ),
        );
    }

    pub fn record_reorder(&mut self, summary: impl Into<String>) {
        if self.records_reorders() {
            self.ledger.record(EvidenceKind::Reorder, summary);
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_checkpoint_decode_failure<E>(&mut self, mode: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Durability,
            format!("checkpoint decode failure mode={mode}: {error}"),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
