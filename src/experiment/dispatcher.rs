//! Parallel action dispatcher.
//!
//! Runs a group of independent device actions concurrently and returns only
//! once every member has finished. Members are never cancelled: a failing
//! member does not stop the others, because a pump stroke or gantry move in
//! progress cannot be interrupted safely.

use crate::error::{AppResult, RigError};
use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Run every action on its own task and wait for all of them.
///
/// Results come back in submission order. If any member failed, the error of
/// the earliest-submitted failing member is returned, after the whole group
/// has finished. A member that panicked surfaces as [`RigError::Dispatch`].
pub async fn dispatch_all<T, F>(actions: Vec<F>) -> AppResult<Vec<T>>
where
    F: Future<Output = AppResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let count = actions.len();
    let mut group = JoinSet::new();
    for (index, action) in actions.into_iter().enumerate() {
        group.spawn(async move { (index, action.await) });
    }
    debug!(members = count, "Dispatched parallel group");

    let mut results: Vec<Option<AppResult<T>>> = (0..count).map(|_| None).collect();
    let mut join_failure = None;
    while let Some(joined) = group.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Err(e) = &result {
                    warn!(member = index, error = %e, "Parallel action failed");
                }
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => {
                warn!(error = %e, "Parallel action did not complete");
                join_failure.get_or_insert_with(|| e.to_string());
            }
        }
    }

    let mut values = Vec::with_capacity(count);
    for result in results {
        match result {
            Some(Ok(value)) => values.push(value),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(RigError::Dispatch(
                    join_failure.unwrap_or_else(|| "member result missing".to_string()),
                ))
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_group() {
        let results: Vec<u8> = dispatch_all(Vec::<BoxFuture<'static, AppResult<u8>>>::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let actions: Vec<BoxFuture<'static, AppResult<u64>>> = [30u64, 10, 20]
            .into_iter()
            .map(|ms| {
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, RigError>(ms)
                }
                .boxed()
            })
            .collect();
        assert_eq!(dispatch_all(actions).await.unwrap(), vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_earliest_submitted_error_wins() {
        let actions: Vec<BoxFuture<'static, AppResult<()>>> = vec![
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err::<(), _>(RigError::DeviceNotFound("first".into()))
            }
            .boxed(),
            async { Err::<(), _>(RigError::DeviceNotFound("second".into())) }.boxed(),
        ];
        let err = dispatch_all(actions).await.unwrap_err();
        assert!(matches!(err, RigError::DeviceNotFound(ref d) if d == "first"));
    }

    #[tokio::test]
    async fn test_panicking_member_reported() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let actions: Vec<BoxFuture<'static, AppResult<()>>> = vec![
            async {
                if std::hint::black_box(true) {
                    panic!("member exploded");
                }
                Ok::<(), RigError>(())
            }
            .boxed(),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), RigError>(())
            }
            .boxed(),
        ];
        let err = dispatch_all(actions).await.unwrap_err();
        assert!(matches!(err, RigError::Dispatch(_)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
