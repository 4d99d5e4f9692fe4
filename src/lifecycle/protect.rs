//! Call boundary for user functions.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;

use crate::core::{Boom, ErrorKind};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a user future, turning a panic into a 500 `HandlerFailed`.
pub async fn protect<F, T>(what: &str, fut: F) -> Result<T, Boom>
where
    F: Future<Output = Result<T, Boom>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("{what} panicked: {message}");
            Err(Boom::internal(format!("{what} panicked: {message}"))
                .with_kind(ErrorKind::HandlerFailed))
        }
    }
}

/// Like [`protect`], bounded by an optional timeout producing a 500.
pub async fn protect_with_timeout<F, T>(
    what: &str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, Boom>
where
    F: Future<Output = Result<T, Boom>>,
{
    match timeout {
        None => protect(what, fut).await,
        Some(limit) => match tokio::time::timeout(limit, protect(what, fut)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("{what} timed out after {limit:?}");
                Err(Boom::internal(format!("{what} timed out"))
                    .with_kind(ErrorKind::HandlerFailed))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passes_results_through() {
        let ok: Result<u8, Boom> = protect("f", async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: Result<u8, Boom> = protect("f", async { Err(Boom::forbidden("no")) }).await;
        assert_eq!(err.unwrap_err().status(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_failed() {
        let err = protect::<_, ()>("handler", async { panic!("kaboom") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerFailed);
        assert!(err.message().contains("kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let err = protect_with_timeout::<_, ()>(
            "ext",
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandlerFailed);
    }
}
