use std::{cell::RefCell, rc::Rc};

use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};
use leptos::*;

use crate::{util::spawn_local, QueryErrorValue, QueryStatus, StatusStorage};

/// A pending request, cloneable so every caller can await the same result.
pub(crate) type SharedRequest<R, E> = Shared<LocalBoxFuture<'static, Result<R, E>>>;

/// Request gate of a single query instance.
///
/// At most one request runs at a time. Callers arriving while it runs join it instead of
/// issuing their own.
pub(crate) struct AuxiliaryQuery<R: 'static, E: 'static> {
    status: StatusStorage<E>,
    background: Option<StatusStorage<E>>,
    in_flight: Rc<RefCell<Option<SharedRequest<R, E>>>>,
    is_invalid: RwSignal<bool>,
}

impl<R, E> Clone for AuxiliaryQuery<R, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status.clone(),
            background: self.background.clone(),
            in_flight: self.in_flight.clone(),
            is_invalid: self.is_invalid,
        }
    }
}

impl<R, E> AuxiliaryQuery<R, E>
where
    R: Clone + 'static,
    E: QueryErrorValue,
{
    pub(crate) fn new(status: StatusStorage<E>, background: Option<StatusStorage<E>>) -> Self {
        Self {
            status,
            background,
            in_flight: Rc::new(RefCell::new(None)),
            is_invalid: RwSignal::new(false),
        }
    }

    pub(crate) fn status(&self) -> &StatusStorage<E> {
        &self.status
    }

    pub(crate) fn background(&self) -> Option<&StatusStorage<E>> {
        self.background.as_ref()
    }

    /// Tracked.
    pub(crate) fn is_invalid(&self) -> bool {
        self.is_invalid.get()
    }

    pub(crate) fn is_invalid_untracked(&self) -> bool {
        self.is_invalid.get_untracked()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.in_flight
            .try_borrow()
            .expect("has_pending borrow")
            .is_some()
    }

    pub(crate) fn pending(&self) -> Option<SharedRequest<R, E>> {
        self.in_flight
            .try_borrow()
            .expect("pending borrow")
            .clone()
    }

    /// Forces the next access to refetch.
    pub(crate) fn invalidate(&self) {
        self.is_invalid.set(true);
    }

    /// Data was written without a request: the instance is valid and successful again.
    pub(crate) fn submit_success(&self) {
        self.is_invalid.set(false);
        if !self.has_pending() {
            self.status.set_statuses(QueryStatus::success());
        }
    }

    /// Returns the pending request, or starts one.
    ///
    /// `on_success` runs once, for the request that is started here, before the status cell
    /// turns successful. Joining callers get the result from the returned future.
    pub(crate) fn unified<F>(
        &self,
        executor: F,
        on_success: impl FnOnce(&R) + 'static,
    ) -> SharedRequest<R, E>
    where
        F: FnOnce() -> LocalBoxFuture<'static, Result<R, E>>,
    {
        if let Some(pending) = self
            .in_flight
            .try_borrow()
            .expect("unified borrow")
            .as_ref()
        {
            return pending.clone();
        }

        // Background instances that already succeeded refresh behind their foreground status.
        let target = match &self.background {
            Some(background) if self.status.is_success_untracked() => background.clone(),
            _ => self.status.clone(),
        };
        target.set_statuses(QueryStatus::loading());

        let request = executor();
        let in_flight = self.in_flight.clone();
        let is_invalid = self.is_invalid;
        let shared = async move {
            let result = request.await;
            in_flight
                .try_borrow_mut()
                .expect("unified completion borrow_mut")
                .take();
            match &result {
                Ok(value) => {
                    is_invalid.set(false);
                    on_success(value);
                    target.set_statuses(QueryStatus::success());
                }
                Err(error) => {
                    target.set_statuses(QueryStatus::failure(error.clone()));
                }
            }
            result
        }
        .boxed_local()
        .shared();

        *self
            .in_flight
            .try_borrow_mut()
            .expect("unified borrow_mut") = Some(shared.clone());

        // Drive the request even if every caller drops its handle.
        let driver = shared.clone();
        spawn_local(async move {
            let _ = driver.await;
        });

        shared
    }
}
