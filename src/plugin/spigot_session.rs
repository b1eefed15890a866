//! Cookie-based spigotmc.org session built on a reqwest cookie jar.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};

use crate::plugin::download::{self, ContentPolicy, DownloadError, Progress};
use crate::plugin::session::{AuthError, AuthSession, Credentials, SessionOpener, StoredCookie};

const SITE: &str = "https://www.spigotmc.org";
const SESSION_COOKIES: [&str; 2] = ["xf_user", "xf_session"];
/// Only rendered for logged-in visitors.
const LOGGED_IN_MARKER: &str = "accountUsername";

pub struct SpigotSessionOpener {
    timeout: Duration,
}

impl SpigotSessionOpener {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionOpener for SpigotSessionOpener {
    async fn open(&self) -> Result<Box<dyn AuthSession>, AuthError> {
        let site = Url::parse(SITE).map_err(|e| AuthError::Transport(e.to_string()))?;
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .user_agent(concat!("plugin-updater/", env!("CARGO_PKG_VERSION")))
            .cookie_provider(Arc::clone(&jar))
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        tracing::debug!("opened spigot session");
        Ok(Box::new(HttpSession { client, jar, site }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    jar: Arc<Jar>,
    site: Url,
}

impl HttpSession {
    async fn logged_in(&self) -> Result<bool, AuthError> {
        let url = format!("{SITE}/login");
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Transport(e.to_string()))?
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(body.contains(LOGGED_IN_MARKER))
    }
}

#[async_trait]
impl AuthSession for HttpSession {
    async fn restore(&self, cookies: &[StoredCookie]) -> Result<bool, AuthError> {
        for name in SESSION_COOKIES {
            if !cookies.iter().any(|c| c.name == name) {
                return Err(AuthError::State(format!("saved session lacks '{name}'")));
            }
        }

        for cookie in cookies.iter().filter(|c| SESSION_COOKIES.contains(&c.name.as_str())) {
            self.jar.add_cookie_str(
                &format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                ),
                &self.site,
            );
        }
        self.logged_in().await
    }

    async fn login(&self, credentials: &Credentials) -> Result<bool, AuthError> {
        let url = format!("{SITE}/login/login");
        let form = [
            ("login", credentials.username.as_str()),
            ("password", credentials.password()),
            ("remember", "1"),
            ("redirect", "/"),
        ];
        self.client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        self.logged_in().await
    }

    fn export_cookies(&self) -> Result<Vec<StoredCookie>, AuthError> {
        let header = self
            .jar
            .cookies(&self.site)
            .ok_or_else(|| AuthError::State("no cookies after login".to_string()))?;
        let header = header
            .to_str()
            .map_err(|e| AuthError::State(e.to_string()))?;

        let domain = self.site.host_str().unwrap_or("www.spigotmc.org");
        let cookies = parse_cookie_header(header, domain);
        for name in SESSION_COOKIES {
            if !cookies.iter().any(|c| c.name == name) {
                return Err(AuthError::State(format!("'{name}' cookie missing after login")));
            }
        }
        Ok(cookies)
    }

    async fn fetch_authenticated(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        // Resources the account has not bought redirect to the purchase page.
        if response.url().path().contains("/purchase") {
            return Err(DownloadError::NotOwned {
                url: url.to_string(),
            });
        }

        download::write_response(response, dest, policy, progress).await
    }

    async fn close(&self) {
        tracing::debug!("closed spigot session");
    }
}

/// Keeps only the session cookies from a `name=value; name=value` header.
fn parse_cookie_header(header: &str, domain: &str) -> Vec<StoredCookie> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| SESSION_COOKIES.contains(name))
        .map(|(name, value)| StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_keeps_only_session_cookies() {
        let cookies = parse_cookie_header(
            "xf_user=1%2Cabc; __cf_bm=zzz; xf_session=s3ss",
            "www.spigotmc.org",
        );
        let names: Vec<&str> = cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["xf_user", "xf_session"]);
        assert_eq!(cookies[0].value, "1%2Cabc");
        assert_eq!(cookies[1].domain, "www.spigotmc.org");
    }

    #[tokio::test]
    async fn restore_requires_both_session_cookies() {
        let opener = SpigotSessionOpener::new(Duration::from_secs(1));
        let session = opener.open().await.unwrap();
        let only_user = [StoredCookie {
            name: "xf_user".into(),
            value: "1".into(),
            domain: "www.spigotmc.org".into(),
            path: "/".into(),
        }];

        let err = session.restore(&only_user).await.unwrap_err();
        assert!(matches!(err, AuthError::State(msg) if msg.contains("xf_session")));
    }

    #[tokio::test]
    async fn export_without_login_reports_missing_cookies() {
        let session = SpigotSessionOpener::new(Duration::from_secs(1))
            .open()
            .await
            .unwrap();
        assert!(session.export_cookies().is_err());
    }
}
