//! Runtime configuration

use super::clock::ClockMode;

/// Configuration for a `run_blocking` invocation
#[derive(Debug, Clone)]
pub struct Config {
    /// Virtual (logical) or wall-clock time
    pub clock: ClockMode,
    /// Label used in log lines, handy when runtimes nest
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clock: ClockMode::Virtual,
            name: "main".to_string(),
        }
    }
}

impl Config {
    pub fn clock(mut self, mode: ClockMode) -> Self {
        self.clock = mode;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Shorthand for a wall-clock runtime
    pub fn wall() -> Self {
        Self::default().clock(ClockMode::Wall)
    }
}
