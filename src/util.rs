// SPDX-License-Identifier: GPL-3.0-or-later
use std::panic;

use tokio::task::JoinError;

/// Collapse the result of a spawned fallible task into a single [anyhow::Result].
///
/// Panics within the task are resumed on the current thread.
pub(crate) fn flatten_join_result<T, E>(
    join_result: Result<Result<T, E>, JoinError>,
) -> anyhow::Result<T>
where
    anyhow::Error: From<E>,
{
    match join_result {
        Ok(inner_result) => Ok(inner_result?),
        Err(join_error) => {
            if join_error.is_panic() {
                panic::resume_unwind(join_error.into_panic());
            } else {
                Err(join_error.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::flatten_join_result;

    #[tokio::test]
    async fn task_results() {
        let ok = tokio::spawn(async { Ok::<_, anyhow::Error>(3) }).await;
        assert_eq!(flatten_join_result(ok).ok(), Some(3));
        let err = tokio::spawn(async { Err::<(), _>(anyhow::anyhow!("nope")) }).await;
        assert!(flatten_join_result(err).is_err());
    }

    #[tokio::test]
    async fn cancelled_task() {
        let task = tokio::spawn(futures::future::pending::<anyhow::Result<()>>());
        task.abort();
        assert!(flatten_join_result(task.await).is_err());
    }
}
