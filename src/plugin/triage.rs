//! Deciding what happens to each check result.
//!
//! [`triage`] is a pure function of the result and the profile, so running
//! it twice over the same results gives the same decisions.

use crate::model::check::{CheckResult, ResultCode};
use crate::model::profile::Profile;

/// Which download path an update takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Plain url, handled by the parallel download manager.
    Parallel,
    /// Needs the shared authenticated session.
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    UpToDate,
    Warn(String),
    /// Report only (old → new, url).
    Notify(String),
    Update(Route),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub disposition: Disposition,
    /// Latest version to persist right away, if any.
    pub write_latest: Option<String>,
}

pub fn triage(result: &CheckResult, profile: Profile) -> Decision {
    let latest = result.latest_version();
    let disposition = match result.code() {
        ResultCode::UpToDate => Disposition::UpToDate,
        ResultCode::NotFound => Disposition::Warn("not found by any provider".to_string()),
        ResultCode::ProviderError => Disposition::Warn(match &result.error {
            Some(err) => err.to_string(),
            None => "provider error".to_string(),
        }),
        // only reached when a result is triaged again after its task finished
        ResultCode::Downloaded | ResultCode::Installed => Disposition::UpToDate,
        ResultCode::UpdateAvailable if profile == Profile::Notify => {
            Disposition::Notify(format!(
                "{} {} -> {} ({})",
                result.name(),
                result.plugin.declared_version().unwrap_or("?"),
                latest.unwrap_or("?"),
                result.download_url.as_deref().unwrap_or("no download url"),
            ))
        }
        ResultCode::UpdateAvailable if !result.download_type.is_supported() => {
            Disposition::Warn(format!(
                "update {} available but download type '{}' is not supported",
                latest.unwrap_or("?"),
                result.download_type.label()
            ))
        }
        ResultCode::UpdateAvailable if result.download_url.is_none() => Disposition::Warn(
            format!("update {} available but no download url", latest.unwrap_or("?")),
        ),
        ResultCode::UpdateAvailable if result.is_premium() => Disposition::Update(Route::Exclusive),
        ResultCode::UpdateAvailable => Disposition::Update(Route::Parallel),
    };

    let write_latest = match (&disposition, result.code()) {
        (Disposition::Notify(_), _) => None,
        (_, ResultCode::UpdateAvailable) => latest.map(str::to_string),
        _ => None,
    };

    Decision {
        disposition,
        write_latest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::check::DownloadType;
    use crate::model::record::{PluginRecord, ProviderIds};
    use crate::plugin::checker::{CheckError, Lookup};
    use std::sync::Arc;

    fn result(latest: &str, download_type: DownloadType, premium: bool) -> CheckResult {
        let mut record = PluginRecord::new("Example", "plugins/Example.jar").unwrap();
        record.version = Some("1.0".into());
        CheckResult::from_lookup(
            Arc::new(record),
            Lookup {
                latest_version: latest.into(),
                download_url: Some("https://example.invalid/Example.jar".into()),
                download_type,
                ids: ProviderIds::default(),
                premium,
            },
        )
    }

    #[test]
    fn ordinary_update_goes_parallel_and_persists_latest() {
        let decision = triage(&result("1.1", DownloadType::Jar, false), Profile::Automatic);
        assert_eq!(decision.disposition, Disposition::Update(Route::Parallel));
        assert_eq!(decision.write_latest.as_deref(), Some("1.1"));
    }

    #[test]
    fn premium_update_takes_the_exclusive_route() {
        let decision = triage(&result("1.1", DownloadType::External, true), Profile::Manual);
        assert_eq!(decision.disposition, Disposition::Update(Route::Exclusive));
    }

    #[test]
    fn notify_reports_without_writing_anything() {
        let decision = triage(&result("1.1", DownloadType::Jar, true), Profile::Notify);
        assert_eq!(
            decision.disposition,
            Disposition::Notify(
                "Example 1.0 -> 1.1 (https://example.invalid/Example.jar)".into()
            )
        );
        assert_eq!(decision.write_latest, None);
    }

    #[test]
    fn unsupported_type_warns_but_still_persists_latest() {
        let decision = triage(
            &result("1.1", DownloadType::Other(".zip".into()), false),
            Profile::Automatic,
        );
        assert!(matches!(decision.disposition, Disposition::Warn(ref m) if m.contains(".zip")));
        assert_eq!(decision.write_latest.as_deref(), Some("1.1"));
    }

    #[test]
    fn equal_versions_are_up_to_date() {
        let decision = triage(&result("1.0", DownloadType::Jar, false), Profile::Automatic);
        assert_eq!(decision.disposition, Disposition::UpToDate);
        assert_eq!(decision.write_latest, None);
    }

    #[test]
    fn provider_error_becomes_a_warning_with_its_cause() {
        let record = Arc::new(PluginRecord::new("Broken", "plugins/Broken.jar").unwrap());
        let failed = CheckResult::provider_error(
            record,
            CheckError::Timeout(std::time::Duration::from_secs(3)),
        );
        let decision = triage(&failed, Profile::Automatic);
        assert_eq!(
            decision.disposition,
            Disposition::Warn("version check timed out after 3s".into())
        );
    }

    #[test]
    fn triage_is_idempotent() {
        let results = [
            result("1.1", DownloadType::Jar, false),
            result("1.1", DownloadType::Jar, true),
            result("1.0", DownloadType::Jar, false),
            result("2.0", DownloadType::Unknown, false),
        ];
        for profile in [Profile::Notify, Profile::Manual, Profile::Automatic] {
            let first: Vec<_> = results.iter().map(|r| triage(r, profile)).collect();
            let second: Vec<_> = results.iter().map(|r| triage(r, profile)).collect();
            assert_eq!(first, second);
        }
    }
}
