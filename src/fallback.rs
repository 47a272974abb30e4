//! Baseline fallbacks for optional pipeline stages.
//!
//! Rewriting, hybrid retrieval and reranking all improve results but are
//! never allowed to fail a request. Each stage runs through one of these
//! wrappers: try the enhanced path, log a warning on failure, return the
//! baseline.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

/// Await `enhanced`; on error, log and return `baseline()`.
pub async fn with_fallback<T, E, Fut>(
    stage: &'static str,
    enhanced: Fut,
    baseline: impl FnOnce() -> T,
) -> T
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    match enhanced.await {
        Ok(value) => value,
        Err(e) => {
            warn!(stage, error = %e, "stage failed, using baseline");
            baseline()
        }
    }
}

/// Await `primary`; if it yields no rows, await `secondary` instead.
///
/// Errors from `primary` propagate unchanged: an empty result is a signal
/// to widen the query, a failure is not.
pub async fn or_if_empty<T, E, Fut, Fut2>(
    stage: &'static str,
    primary: Fut,
    secondary: impl FnOnce() -> Fut2,
) -> Result<Vec<T>, E>
where
    Fut: Future<Output = Result<Vec<T>, E>>,
    Fut2: Future<Output = Result<Vec<T>, E>>,
{
    let rows = primary.await?;
    if !rows.is_empty() {
        return Ok(rows);
    }
    warn!(stage, "no results, falling back");
    secondary().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_fallback_success() {
        let v = with_fallback("t", async { Ok::<_, String>(1) }, || 0).await;
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn test_with_fallback_error_returns_baseline() {
        let v = with_fallback("t", async { Err::<i32, _>("boom") }, || 7).await;
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_or_if_empty_keeps_primary_rows() {
        let rows = or_if_empty(
            "t",
            async { Ok::<_, String>(vec![1]) },
            || async { Ok(vec![2]) },
        )
        .await
        .unwrap();
        assert_eq!(rows, vec![1]);
    }

    #[tokio::test]
    async fn test_or_if_empty_runs_secondary() {
        let rows = or_if_empty(
            "t",
            async { Ok::<Vec<i32>, String>(vec![]) },
            || async { Ok(vec![2, 3]) },
        )
        .await
        .unwrap();
        assert_eq!(rows, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_or_if_empty_propagates_primary_error() {
        let res = or_if_empty(
            "t",
            async { Err::<Vec<i32>, _>("down".to_string()) },
            || async { Ok(vec![2]) },
        )
        .await;
        assert!(res.is_err());
    }
}
