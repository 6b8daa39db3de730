//! Shared utility functions for provider adapters.

use nexus3_domain::config::AuthConfig;
use nexus3_domain::error::{Error, Result};
use std::time::Duration;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from an [`AuthConfig`].
///
/// Precedence: plaintext `key` field (warns — prefer `env`), then `env`.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!("API key loaded from plaintext config field 'key' — prefer 'env'");
        return Ok(key.clone());
    }

    if let Some(ref env_var) = auth.env {
        return std::env::var(env_var).map_err(|_| {
            Error::Auth(format!("environment variable '{env_var}' not set or not valid UTF-8"))
        });
    }

    Err(Error::Auth(
        "no API key configured: set 'key' or 'env' in AuthConfig".into(),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry with exponential backoff (spec §4.8 "Failure mode")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// base 1.0s, multiplier 1.5, capped at 10s, up to `max_attempts` tries.
/// `retry_after` overrides the computed delay for one attempt when the
/// provider returned a `Retry-After` header (429/5xx).
pub(crate) fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    let base = 1.0_f64;
    let multiplier = 1.5_f64;
    let secs = (base * multiplier.powi(attempt as i32)).min(10.0);
    Duration::from_secs_f64(secs)
}

/// Run `attempt` up to `max_attempts` times, retrying only while
/// `is_retriable` holds for the returned error, sleeping with
/// exponential backoff between tries.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    mut is_retriable: impl FnMut(&Error) -> bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for n in 0..max_attempts.max(1) {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if n + 1 >= max_attempts || !is_retriable(&e) {
                    return Err(e);
                }
                tokio::time::sleep(backoff_delay(n, None)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Internal("retry loop exited without a result".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn resolve_api_key_plaintext() {
        let auth = AuthConfig {
            key: Some("sk-test-123".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "sk-test-123");
    }

    #[test]
    fn resolve_api_key_env_var() {
        let var_name = "NEXUS3_TEST_RESOLVE_ENV_KEY_1234";
        std::env::set_var(var_name, "env-secret-value");
        let auth = AuthConfig {
            env: Some(var_name.into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn resolve_api_key_env_var_missing() {
        let auth = AuthConfig {
            env: Some("NEXUS3_TEST_NONEXISTENT_VAR_8888".into()),
            ..Default::default()
        };
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("NEXUS3_TEST_NONEXISTENT_VAR_8888"));
    }

    #[test]
    fn resolve_api_key_no_config() {
        let err = resolve_api_key(&AuthConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no API key configured"));
    }

    #[test]
    fn backoff_grows_and_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(0, None), Duration::from_secs_f64(1.0));
        assert!(backoff_delay(5, None) <= Duration::from_secs(10));
        assert_eq!(backoff_delay(20, None), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_overrides_computed_delay() {
        let d = backoff_delay(0, Some(Duration::from_millis(250)));
        assert_eq!(d, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_stops_on_non_retriable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            5,
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Auth("nope".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            3,
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Timeout("slow".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            5,
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Timeout("slow".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
