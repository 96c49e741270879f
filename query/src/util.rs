use std::{future::Future, time::Duration};

/// Spawns a task on the local (single threaded) executor.
///
/// Outside the browser this must be called from within a [`tokio::task::LocalSet`].
pub(crate) fn spawn_local<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "csr")] {
            leptos::spawn_local(fut);
        } else if #[cfg(not(target_arch = "wasm32"))] {
            // Detached, the handle is only needed for cancellation which goes through `Abortable`.
            let _ = tokio::task::spawn_local(fut);
        } else {
            let _ = fut;
            compile_error!("leptos_query_cache needs the 'csr' feature on wasm32 targets.");
        }
    }
}

pub(crate) async fn sleep(duration: Duration) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "csr")] {
            gloo_timers::future::sleep(duration).await;
        } else if #[cfg(not(target_arch = "wasm32"))] {
            tokio::time::sleep(duration).await;
        } else {
            let _ = duration;
        }
    }
}

/// Yields once to the executor so queued tasks can make progress.
#[cfg(test)]
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
