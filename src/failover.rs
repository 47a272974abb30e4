//! Key and model failover for provider calls.
//!
//! [`KeyManager`] wraps a [`KeyPool`] and runs provider operations with the
//! retry rules shared by every provider:
//!
//! | Failure | Action |
//! |---------|--------|
//! | rate limit / quota | rotate to the next key, retry (each key at most once) |
//! | invalid credential | fail immediately, no rotation |
//! | anything else | fail immediately (single-model) or try the next model on the same key |
//!
//! Streaming calls do not go through the retry loop: an open stream cannot be
//! replayed, so callers take a credential with
//! [`KeyManager::streaming_credential`] and report mid-stream rate limits
//! with [`KeyManager::note_rate_limited`].

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FailoverError, ProviderError};
use crate::keypool::{Credential, KeyPool};

#[derive(Clone)]
pub struct KeyManager {
    pool: Arc<KeyPool>,
}

impl KeyManager {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// Run `op` with the current key, rotating on rate limits.
    ///
    /// Makes at most one attempt per key. With N keys that all rate-limit,
    /// exactly N attempts are made before [`FailoverError::Exhausted`].
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, FailoverError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let total = self.pool.len();
        if total == 0 {
            return Err(FailoverError::NoKeys);
        }

        let mut last = None;
        for attempt in 1..=total {
            let cred = self.pool.current().ok_or(FailoverError::NoKeys)?;
            let index = cred.index;

            match op(cred).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_invalid_credential() => {
                    warn!(pool = %self.pool.name(), key_index = index, error = %e, "invalid API key");
                    return Err(FailoverError::InvalidCredential { index, source: e });
                }
                Err(e) if e.is_rate_limit() => {
                    warn!(
                        pool = %self.pool.name(),
                        key_index = index,
                        attempt,
                        total,
                        "rate limited, rotating key"
                    );
                    self.pool.rotate_from(index);
                    last = Some(e);
                }
                Err(e) => return Err(FailoverError::Provider(e)),
            }
        }

        Err(FailoverError::Exhausted {
            attempts: total,
            last,
        })
    }

    /// Run `op` over an ordered model chain for each key.
    ///
    /// On one key, a non-rate-limit failure moves to the next model. A rate
    /// limit abandons the remaining models and rotates the key. If every
    /// model fails on a key without a rate limit, the last model error is
    /// returned.
    pub async fn execute_with_model_fallback<T, F, Fut>(
        &self,
        models: &[String],
        mut op: F,
    ) -> Result<T, FailoverError>
    where
        F: FnMut(Credential, String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if models.is_empty() {
            return Err(FailoverError::Provider(ProviderError::request(
                "no generation models configured",
            )));
        }
        let total = self.pool.len();
        if total == 0 {
            return Err(FailoverError::NoKeys);
        }

        let mut last_rate_limit = None;
        for attempt in 1..=total {
            let cred = self.pool.current().ok_or(FailoverError::NoKeys)?;
            let index = cred.index;
            let mut rate_limited = None;
            let mut last_model_err = None;

            for model in models {
                match op(cred.clone(), model.clone()).await {
                    Ok(value) => {
                        debug!(key_index = index, model = %model, "provider call succeeded");
                        return Ok(value);
                    }
                    Err(e) if e.is_invalid_credential() => {
                        warn!(pool = %self.pool.name(), key_index = index, error = %e, "invalid API key");
                        return Err(FailoverError::InvalidCredential { index, source: e });
                    }
                    Err(e) if e.is_rate_limit() => {
                        rate_limited = Some(e);
                        break;
                    }
                    Err(e) => {
                        warn!(key_index = index, model = %model, error = %e, "model failed, trying next model");
                        last_model_err = Some(e);
                    }
                }
            }

            match rate_limited {
                Some(e) => {
                    warn!(
                        pool = %self.pool.name(),
                        key_index = index,
                        attempt,
                        total,
                        "rate limited, rotating key"
                    );
                    self.pool.rotate_from(index);
                    last_rate_limit = Some(e);
                }
                None => {
                    return Err(FailoverError::Provider(
                        last_model_err.unwrap_or(ProviderError::EmptyResponse),
                    ))
                }
            }
        }

        Err(FailoverError::Exhausted {
            attempts: total,
            last: last_rate_limit,
        })
    }

    /// The key a new stream should be opened with.
    pub fn streaming_credential(&self) -> Result<Credential, FailoverError> {
        self.pool.current().ok_or(FailoverError::NoKeys)
    }

    /// Record that `cred` hit a rate limit on an open stream so the next
    /// request starts on a different key. The stream itself is not retried.
    pub fn note_rate_limited(&self, cred: &Credential) {
        warn!(pool = %self.pool.name(), key_index = cred.index, "rate limited mid-stream");
        self.pool.rotate_from(cred.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(n: usize) -> KeyManager {
        let keys = (0..n).map(|i| format!("key-{}", i));
        KeyManager::new(Arc::new(KeyPool::new("test", keys)))
    }

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited {
            message: "429".into(),
        }
    }

    fn invalid() -> ProviderError {
        ProviderError::InvalidCredential {
            message: "API key not valid".into(),
        }
    }

    #[tokio::test]
    async fn test_all_keys_rate_limited_makes_n_attempts() {
        let km = manager(3);
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = km
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result,
            Err(FailoverError::Exhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_key_makes_one_attempt() {
        let km = manager(3);
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = km
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(invalid()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_invalid_credential());
        assert_eq!(km.pool().current().unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_other_error_is_not_retried() {
        let km = manager(2);
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = km
            .execute_with_retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::request("500")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(FailoverError::Provider(_))));
    }

    #[tokio::test]
    async fn test_rotates_to_working_key() {
        let km = manager(3);
        let result = km
            .execute_with_retry(|cred| async move {
                if cred.index == 0 {
                    Err(rate_limited())
                } else {
                    Ok(cred.key)
                }
            })
            .await;
        assert_eq!(result.unwrap(), "key-1");
        assert_eq!(km.pool().current().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_no_keys() {
        let km = manager(0);
        let result: Result<(), _> = km.execute_with_retry(|_| async { Ok(()) }).await;
        assert_eq!(result.unwrap_err(), FailoverError::NoKeys);
    }

    #[tokio::test]
    async fn test_model_fallback_same_key() {
        let km = manager(2);
        let models = vec!["m1".to_string(), "m2".to_string()];
        let seen = std::sync::Mutex::new(Vec::new());
        let result = km
            .execute_with_model_fallback(&models, |cred, model| {
                seen.lock().unwrap().push((cred.index, model.clone()));
                async move {
                    if model == "m1" {
                        Err(ProviderError::request("model not found"))
                    } else {
                        Ok(model)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "m2");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, "m1".to_string()), (0, "m2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_model_fallback_rate_limit_rotates_key() {
        let km = manager(2);
        let models = vec!["m1".to_string(), "m2".to_string()];
        let seen = std::sync::Mutex::new(Vec::new());
        let result = km
            .execute_with_model_fallback(&models, |cred, model| {
                seen.lock().unwrap().push((cred.index, model.clone()));
                async move {
                    if cred.index == 0 {
                        Err(rate_limited())
                    } else {
                        Ok(format!("{}:{}", cred.index, model))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "1:m1");
        // m2 on key 0 is never attempted after the rate limit.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, "m1".to_string()), (1, "m1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_model_fallback_all_models_fail_returns_last_error() {
        let km = manager(2);
        let models = vec!["m1".to_string(), "m2".to_string()];
        let result: Result<(), _> = km
            .execute_with_model_fallback(&models, |_, model| async move {
                Err(ProviderError::request(format!("{} failed", model)))
            })
            .await;
        match result {
            Err(FailoverError::Provider(ProviderError::Request { message })) => {
                assert_eq!(message, "m2 failed")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_model_fallback_invalid_key_aborts() {
        let km = manager(2);
        let models = vec!["m1".to_string(), "m2".to_string()];
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = km
            .execute_with_model_fallback(&models, |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(invalid()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_invalid_credential());
    }

    #[tokio::test]
    async fn test_concurrent_rate_limits_do_not_skip_a_key() {
        let km = manager(3);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let run = |km: KeyManager, barrier: Arc<tokio::sync::Barrier>| async move {
            km.execute_with_retry(|cred| {
                let barrier = barrier.clone();
                async move {
                    if cred.index == 0 {
                        // Both requests observe key 0 before either rotates.
                        barrier.wait().await;
                        Err(rate_limited())
                    } else {
                        Ok(cred.index)
                    }
                }
            })
            .await
        };

        let (a, b) = tokio::join!(
            run(km.clone(), barrier.clone()),
            run(km.clone(), barrier.clone())
        );
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(km.pool().current().unwrap().index, 1);
    }

    #[test]
    fn test_note_rate_limited_rotates_for_next_request() {
        let km = manager(2);
        let cred = km.streaming_credential().unwrap();
        km.note_rate_limited(&cred);
        assert_eq!(km.streaming_credential().unwrap().index, 1);
    }
}
