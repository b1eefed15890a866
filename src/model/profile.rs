use serde::Deserialize;

/// Run-wide update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
    /// Report available updates only. No downloads, no file writes.
    Notify,
    /// Download updates into the staging directory.
    Manual,
    /// Download updates and replace the live installation.
    #[default]
    Automatic,
}

impl Profile {
    pub fn label(&self) -> &'static str {
        match self {
            Profile::Notify => "NOTIFY",
            Profile::Manual => "MANUAL",
            Profile::Automatic => "AUTOMATIC",
        }
    }

    pub fn allows_download(&self) -> bool {
        !matches!(self, Profile::Notify)
    }

    pub fn installs(&self) -> bool {
        matches!(self, Profile::Automatic)
    }
}

/// How version checks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// One worker per plugin (optionally capped by `max-parallel-checks`).
    #[default]
    Parallel,
    /// A single worker; checks run one after another.
    Serial,
}

impl Concurrency {
    /// Worker pool size for `plugins` checks. `cap == 0` means uncapped.
    pub fn pool_size(&self, plugins: usize, cap: usize) -> usize {
        match self {
            Concurrency::Serial => 1,
            Concurrency::Parallel if cap == 0 => plugins.max(1),
            Concurrency::Parallel => plugins.clamp(1, cap),
        }
    }
}
