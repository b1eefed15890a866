use std::fmt;

use crate::model::check::{CheckResult, ResultCode};
use crate::plugin::session::AuthError;

/// A user-visible problem that degraded the run without stopping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub plugin: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn plugin(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: Some(name.into()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            plugin: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin {
            Some(plugin) => write!(f, "[{plugin}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Final state of one checked plugin, for the trailing status lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub name: String,
    pub code: ResultCode,
    pub declared_version: Option<String>,
    pub latest_version: Option<String>,
    /// The update's download task ended `FAILED`; `code` stays at
    /// `UPDATE_AVAILABLE` in that case.
    pub task_failed: bool,
}

impl PluginStatus {
    pub fn from_result(result: &CheckResult, task_failed: bool) -> Self {
        Self {
            name: result.name().to_string(),
            code: result.code(),
            declared_version: result.plugin.declared_version().map(str::to_string),
            latest_version: result.latest_version().map(str::to_string),
            task_failed,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.task_failed {
            "FAILED"
        } else {
            self.code.label()
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let declared = self.declared_version.as_deref().unwrap_or("?");
        match &self.latest_version {
            Some(latest) => write!(
                f,
                "[{}] {} ({declared} -> {latest})",
                self.label(),
                self.name
            ),
            None => write!(f, "[{}] {} ({declared})", self.label(), self.name),
        }
    }
}

/// Counts and messages produced by one run.
#[derive(Debug, Default)]
pub struct Summary {
    pub checked: usize,
    pub up_to_date: usize,
    pub updates_available: usize,
    pub downloaded: usize,
    pub installed: usize,
    pub excluded: usize,
    pub errors: usize,
    pub warnings: Vec<Warning>,
    pub notices: Vec<String>,
    pub statuses: Vec<PluginStatus>,
    pub auth_failure: Option<AuthError>,
}

impl Summary {
    /// Warnings alone never fail a run; an authentication hard failure does.
    pub fn is_success(&self) -> bool {
        self.auth_failure.is_none()
    }

    pub fn headline(&self) -> String {
        let verdict = match (self.is_success(), self.warnings.is_empty()) {
            (true, true) => "[OK]".to_string(),
            (true, false) => format!("[OK with {}x WARN]", self.warnings.len()),
            (false, _) => format!("[FAILED with {}x WARN]", self.warnings.len()),
        };

        format!(
            "{verdict} checked {} plugins: {} up to date, {} updates available, {} downloaded, {} installed, {} excluded, {} errors",
            self.checked,
            self.up_to_date,
            self.updates_available,
            self.downloaded,
            self.installed,
            self.excluded,
            self.errors
        )
    }

    pub fn record_final(&mut self, result: &CheckResult, task_failed: bool) {
        match result.code() {
            ResultCode::Downloaded => self.downloaded += 1,
            ResultCode::Installed => {
                self.downloaded += 1;
                self.installed += 1;
            }
            _ => {}
        }
        self.statuses.push(PluginStatus::from_result(result, task_failed));
    }
}
