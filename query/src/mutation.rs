use std::rc::Rc;

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    cached_query::route_error,
    query_options::{MutationOptions, OnError},
    util::spawn_local,
    QueryErrorValue, QueryStatus, StatusStorage, SyncParams,
};

/// Caller supplied write operation of a [`Mutation`].
pub type MutationExecutor<P, V, E> = Rc<dyn Fn(P) -> LocalBoxFuture<'static, Result<V, E>>>;

/// An uncached asynchronous write with its own status.
///
/// Every call runs the executor. Nothing is keyed or deduplicated.
pub struct Mutation<P: 'static, V: 'static, E: 'static> {
    executor: MutationExecutor<P, V, E>,
    status: StatusStorage<E>,
    on_error: Option<OnError<E>>,
}

impl<P, V, E> Clone for Mutation<P, V, E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            status: self.status.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<P, V, E> Mutation<P, V, E>
where
    P: 'static,
    V: Clone + 'static,
    E: QueryErrorValue,
{
    pub(crate) fn new(executor: MutationExecutor<P, V, E>, options: MutationOptions<E>) -> Self {
        Self {
            executor,
            status: StatusStorage::default(),
            on_error: options.on_error,
        }
    }

    /// Runs the mutation in the background and reports through the callbacks.
    pub fn sync(&self, params: P, sync_params: SyncParams<V, E>) {
        let request = self.fetch(params);
        let default_on_error = self.on_error.clone();
        spawn_local(async move {
            match request.await {
                Ok(data) => {
                    if let Some(on_success) = sync_params.on_success {
                        on_success(data);
                    }
                }
                Err(error) => route_error(error, sync_params.on_error, default_on_error.as_ref()),
            }
        });
    }

    /// Runs the mutation and resolves with its result.
    pub fn fetch(&self, params: P) -> LocalBoxFuture<'static, Result<V, E>> {
        let status = self.status.clone();
        status.set_statuses(QueryStatus::loading());
        let request = (self.executor)(params);
        async move {
            let result = request.await;
            match &result {
                Ok(_) => status.set_statuses(QueryStatus::success()),
                Err(error) => status.set_statuses(QueryStatus::failure(error.clone())),
            }
            result
        }
        .boxed_local()
    }

    /// Tracked.
    pub fn statuses(&self) -> QueryStatus<E> {
        self.status.statuses()
    }

    /// Tracked.
    pub fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    /// Tracked.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Tracked.
    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }

    /// Error of the last failed call. Tracked.
    pub fn error(&self) -> Option<E> {
        self.status.error()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        time::Duration,
    };

    use leptos::*;

    use super::*;
    use crate::{util::settle, ClientOptions, QueryClient, QueryState};

    fn client() -> QueryClient<String> {
        QueryClient::with_capabilities(ClientOptions::default(), None, None)
    }

    #[tokio::test(start_paused = true)]
    async fn every_call_runs_executor() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let calls = Rc::new(Cell::new(0));
                let mutation = client().create_mutation({
                    let calls = calls.clone();
                    move |amount: u32| {
                        calls.set(calls.get() + 1);
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, String>(amount * 2)
                        }
                        .boxed_local()
                    }
                });
                assert_eq!(mutation.statuses().state(), QueryState::Idle);

                let results = Rc::new(RefCell::new(Vec::new()));
                for amount in [1, 2] {
                    mutation.sync(
                        amount,
                        SyncParams::default().set_on_success({
                            let results = results.clone();
                            move |doubled| results.borrow_mut().push(doubled)
                        }),
                    );
                }
                settle().await;
                assert!(mutation.is_loading());

                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(calls.get(), 2);
                assert_eq!(*results.borrow(), vec![2, 4]);
                assert!(mutation.is_success());
            })
            .await;
    }

    #[tokio::test]
    async fn failures_reach_status_and_handler() {
        let _ = create_runtime();
        tokio::task::LocalSet::new()
            .run_until(async {
                let handled = Rc::new(RefCell::new(None));
                let mutation = client().create_mutation_with_options(
                    |_: ()| async { Err::<(), _>("denied".to_string()) }.boxed_local(),
                    MutationOptions::default().set_on_error({
                        let handled = handled.clone();
                        move |error: &String| *handled.borrow_mut() = Some(error.clone())
                    }),
                );

                mutation.sync((), SyncParams::default());
                settle().await;
                assert!(mutation.is_error());
                assert_eq!(mutation.error(), Some("denied".to_string()));
                assert_eq!(handled.borrow().as_deref(), Some("denied"));

                assert_eq!(mutation.fetch(()).await, Err("denied".to_string()));
            })
            .await;
    }
}
