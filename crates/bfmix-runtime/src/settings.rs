use std::sync::OnceLock;

use bfmix_core::{DEFAULT_ENGINE_BLOCK, ExecutionMode};

use crate::mode::ModeContext;

pub const ENV_VERBOSE: &str = "BFMIX_VERBOSE";
pub const ENV_SHOW_OPTION: &str = "BFMIX_SHOW_OPTION";
pub const ENV_ENGINE_BLOCK: &str = "BFMIX_ENGINE_BLOCK";
pub const ENV_AUTO_ENGINE: &str = "BFMIX_AUTO_ENGINE";
pub const ENV_AUTO_MIX: &str = "BFMIX_AUTO_MIX";
pub const ENV_TRAIN: &str = "BFMIX_TRAIN";

static GLOBAL_SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Process-wide knobs read once from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    verbose_level: i64,
    show_option: bool,
    engine_block: usize,
    auto_engine: bool,
    auto_mix: bool,
    train: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbose_level: 0,
            show_option: false,
            engine_block: DEFAULT_ENGINE_BLOCK,
            auto_engine: false,
            auto_mix: false,
            train: false,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder {
            settings: Self::default(),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable entries keep their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(level) = optional_int(lookup(ENV_VERBOSE)) {
            settings.verbose_level = level;
        }
        if let Some(flag) = optional_int(lookup(ENV_SHOW_OPTION)) {
            settings.show_option = flag != 0;
        }
        if let Some(block) = optional_int(lookup(ENV_ENGINE_BLOCK))
            .and_then(|block| usize::try_from(block).ok())
            .filter(|block| *block > 0)
        {
            settings.engine_block = block;
        }
        if let Some(flag) = optional_int(lookup(ENV_AUTO_ENGINE)) {
            settings.auto_engine = flag != 0;
        }
        if let Some(flag) = optional_int(lookup(ENV_AUTO_MIX)) {
            settings.auto_mix = flag != 0;
        }
        if let Some(flag) = optional_int(lookup(ENV_TRAIN)) {
            settings.train = flag != 0;
        }
        settings
    }

    /// Settings of this process. The first call reads the environment and,
    /// when `BFMIX_SHOW_OPTION` is set, logs every option.
    pub fn global() -> &'static Settings {
        GLOBAL_SETTINGS.get_or_init(|| {
            let settings = Self::from_env();
            if settings.show_option {
                for line in settings.option_lines() {
                    tracing::info!(target: "bfmix::settings", "{line}");
                }
            }
            settings
        })
    }

    #[must_use]
    pub fn verbose_level(&self) -> i64 {
        self.verbose_level
    }

    #[must_use]
    pub fn show_option(&self) -> bool {
        self.show_option
    }

    #[must_use]
    pub fn engine_block(&self) -> usize {
        self.engine_block
    }

    #[must_use]
    pub fn auto_engine(&self) -> bool {
        self.auto_engine
    }

    #[must_use]
    pub fn auto_mix(&self) -> bool {
        self.auto_mix
    }

    #[must_use]
    pub fn train(&self) -> bool {
        self.train
    }

    /// Frame at the bottom of every thread's mode stack.
    #[must_use]
    pub fn base_mode(&self) -> ModeContext {
        ModeContext {
            engine_enabled: self.auto_engine,
            auto_mix_enabled: self.auto_mix,
            mode: ExecutionMode::from_train(self.train),
        }
    }

    #[must_use]
    pub fn option_lines(&self) -> Vec<String> {
        vec![
            format!("{ENV_VERBOSE} = {}", self.verbose_level),
            format!("{ENV_SHOW_OPTION} = {}", u8::from(self.show_option)),
            format!("{ENV_ENGINE_BLOCK} = {}", self.engine_block),
            format!("{ENV_AUTO_ENGINE} = {}", u8::from(self.auto_engine)),
            format!("{ENV_AUTO_MIX} = {}", u8::from(self.auto_mix)),
            format!("{ENV_TRAIN} = {}", u8::from(self.train)),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    #[must_use]
    pub fn verbose_level(mut self, level: i64) -> Self {
        self.settings.verbose_level = level;
        self
    }

    #[must_use]
    pub fn show_option(mut self, show: bool) -> Self {
        self.settings.show_option = show;
        self
    }

    #[must_use]
    pub fn engine_block(mut self, block: usize) -> Self {
        self.settings.engine_block = block.max(1);
        self
    }

    #[must_use]
    pub fn auto_engine(mut self, enabled: bool) -> Self {
        self.settings.auto_engine = enabled;
        self
    }

    #[must_use]
    pub fn auto_mix(mut self, enabled: bool) -> Self {
        self.settings.auto_mix = enabled;
        self
    }

    #[must_use]
    pub fn train(mut self, train: bool) -> Self {
        self.settings.train = train;
        self
    }

    #[must_use]
    pub fn build(self) -> Settings {
        self.settings
    }
}

fn optional_int(raw: Option<String>) -> Option<i64> {
    raw?.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bfmix_core::{DEFAULT_ENGINE_BLOCK, ExecutionMode};

    use super::{ENV_AUTO_ENGINE, ENV_AUTO_MIX, ENV_ENGINE_BLOCK, ENV_TRAIN, ENV_VERBOSE, Settings};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.engine_block(), DEFAULT_ENGINE_BLOCK);
        assert!(!settings.base_mode().engine_enabled);
    }

    #[test]
    fn integer_flags_are_parsed() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_VERBOSE, "2"),
            (ENV_ENGINE_BLOCK, " 8 "),
            (ENV_AUTO_ENGINE, "1"),
            (ENV_AUTO_MIX, "1"),
            (ENV_TRAIN, "1"),
        ]));
        assert_eq!(settings.verbose_level(), 2);
        assert_eq!(settings.engine_block(), 8);
        let base = settings.base_mode();
        assert!(base.auto_mix_active());
        assert_eq!(base.mode, ExecutionMode::Training);
    }

    #[test]
    fn unparsable_or_invalid_values_are_ignored() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_VERBOSE, "loud"),
            (ENV_ENGINE_BLOCK, "0"),
            (ENV_AUTO_MIX, "yes"),
        ]));
        assert_eq!(settings.verbose_level(), 0);
        assert_eq!(settings.engine_block(), DEFAULT_ENGINE_BLOCK);
        assert!(!settings.auto_mix());
    }

    #[test]
    fn option_lines_list_every_knob() {
        let settings = Settings::builder().engine_block(4).auto_engine(true).build();
        let lines = settings.option_lines();
        assert_eq!(lines.len(), 6);
        assert!(lines.contains(&"BFMIX_ENGINE_BLOCK = 4".to_owned()));
        assert!(lines.contains(&"BFMIX_AUTO_ENGINE = 1".to_owned()));
    }
}
