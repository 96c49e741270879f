use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    time::Duration,
};

use futures::future::{abortable, AbortHandle};

use crate::{
    instant::Instant,
    util::{sleep, spawn_local},
    DocumentVisibility, KeyHash,
};

#[derive(Debug, Clone, Copy)]
struct TimerDate {
    polling_time: Duration,
    target: Instant,
}

/// Invalidates queries a fixed time after their last successful fetch.
///
/// Timers are suspended while the page is hidden. On return each one is either fired right
/// away, if its target passed in the meantime, or re-armed for the time it had left.
#[derive(Clone)]
pub(crate) struct PollingService {
    inner: Rc<PollingInner>,
}

struct PollingInner {
    timers: RefCell<HashMap<KeyHash, AbortHandle>>,
    timer_dates: RefCell<HashMap<KeyHash, TimerDate>>,
    is_visible: Cell<bool>,
    query_exists: Box<dyn Fn(&KeyHash) -> bool>,
    invalidate: Box<dyn Fn(&KeyHash)>,
}

impl PollingService {
    pub(crate) fn new(
        query_exists: impl Fn(&KeyHash) -> bool + 'static,
        invalidate: impl Fn(&KeyHash) + 'static,
        visibility: Option<Rc<dyn DocumentVisibility>>,
    ) -> Self {
        let inner = Rc::new(PollingInner {
            timers: RefCell::new(HashMap::new()),
            timer_dates: RefCell::new(HashMap::new()),
            is_visible: Cell::new(
                visibility
                    .as_ref()
                    .map(|visibility| visibility.is_visible())
                    .unwrap_or(true),
            ),
            query_exists: Box::new(query_exists),
            invalidate: Box::new(invalidate),
        });

        if let Some(visibility) = visibility {
            let weak = Rc::downgrade(&inner);
            visibility.on_visibility_change(Rc::new(move |is_visible| {
                if let Some(inner) = weak.upgrade() {
                    PollingService { inner }.handle_visibility(is_visible);
                }
            }));
        }

        Self { inner }
    }

    /// Arms a timer invalidating `key_hash` after `polling_time`. Replaces any previous timer.
    pub(crate) fn setup_timer(&self, key_hash: &KeyHash, polling_time: Duration) {
        self.abort_timer(key_hash);
        if !(self.inner.query_exists)(key_hash) {
            return;
        }

        self.inner
            .timer_dates
            .try_borrow_mut()
            .expect("setup_timer borrow_mut")
            .insert(
                key_hash.clone(),
                TimerDate {
                    polling_time,
                    target: Instant::now() + polling_time,
                },
            );

        if self.inner.is_visible.get() {
            self.arm(key_hash, polling_time);
        }
    }

    /// Cancels and forgets the timer of `key_hash`.
    pub(crate) fn clean(&self, key_hash: &KeyHash) {
        self.abort_timer(key_hash);
        self.inner
            .timer_dates
            .try_borrow_mut()
            .expect("clean borrow_mut")
            .remove(key_hash);
    }

    /// Re-arms an existing timer with its full interval.
    pub(crate) fn restart(&self, key_hash: &KeyHash) {
        let polling_time = self
            .inner
            .timer_dates
            .try_borrow()
            .expect("restart borrow")
            .get(key_hash)
            .map(|date| date.polling_time);
        if let Some(polling_time) = polling_time {
            self.setup_timer(key_hash, polling_time);
        }
    }

    fn handle_visibility(&self, is_visible: bool) {
        if self.inner.is_visible.replace(is_visible) == is_visible {
            return;
        }

        if !is_visible {
            let timers = std::mem::take(
                &mut *self
                    .inner
                    .timers
                    .try_borrow_mut()
                    .expect("handle_visibility borrow_mut"),
            );
            for (_, handle) in timers {
                handle.abort();
            }
            return;
        }

        let now = Instant::now();
        let dates = self
            .inner
            .timer_dates
            .try_borrow()
            .expect("handle_visibility borrow")
            .iter()
            .map(|(key_hash, date)| (key_hash.clone(), *date))
            .collect::<Vec<_>>();
        for (key_hash, date) in dates {
            let remaining = date.target.saturating_until(now);
            if remaining.is_zero() {
                self.fire(&key_hash);
            } else {
                self.arm(&key_hash, remaining);
            }
        }
    }

    fn arm(&self, key_hash: &KeyHash, delay: Duration) {
        let (timer, handle) = abortable(sleep(delay));
        self.inner
            .timers
            .try_borrow_mut()
            .expect("arm borrow_mut")
            .insert(key_hash.clone(), handle);

        let weak: Weak<PollingInner> = Rc::downgrade(&self.inner);
        let key_hash = key_hash.clone();
        spawn_local(async move {
            if timer.await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                PollingService { inner }.fire(&key_hash);
            }
        });
    }

    fn fire(&self, key_hash: &KeyHash) {
        if (self.inner.query_exists)(key_hash) {
            (self.inner.invalidate)(key_hash);
        }
        self.clean(key_hash);
    }

    fn abort_timer(&self, key_hash: &KeyHash) {
        let handle = self
            .inner
            .timers
            .try_borrow_mut()
            .expect("abort_timer borrow_mut")
            .remove(key_hash);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn armed(&self) -> usize {
        self.inner.timers.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{util::settle, ManualVisibility};

    struct Fixture {
        polling: PollingService,
        visibility: ManualVisibility,
        invalidated: Rc<RefCell<Vec<KeyHash>>>,
        existing: Rc<RefCell<HashSet<KeyHash>>>,
    }

    fn fixture() -> Fixture {
        let visibility = ManualVisibility::new();
        let invalidated = Rc::new(RefCell::new(Vec::new()));
        let existing = Rc::new(RefCell::new(HashSet::new()));
        let polling = PollingService::new(
            {
                let existing = existing.clone();
                move |key_hash| existing.borrow().contains(key_hash)
            },
            {
                let invalidated = invalidated.clone();
                move |key_hash| invalidated.borrow_mut().push(key_hash.clone())
            },
            Some(Rc::new(visibility.clone())),
        );
        Fixture {
            polling,
            visibility,
            invalidated,
            existing,
        }
    }

    fn hash(s: &str) -> KeyHash {
        KeyHash(s.to_string())
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test(start_paused = true)]
    async fn invalidates_after_polling_time() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.existing.borrow_mut().insert(hash("a"));
                f.polling.setup_timer(&hash("a"), ms(1000));

                tokio::time::sleep(ms(999)).await;
                assert!(f.invalidated.borrow().is_empty());

                tokio::time::sleep(ms(2)).await;
                assert_eq!(*f.invalidated.borrow(), vec![hash("a")]);
                assert_eq!(f.polling.armed(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_while_hidden_fires_on_return() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.existing.borrow_mut().insert(hash("a"));
                f.polling.setup_timer(&hash("a"), ms(1000));

                tokio::time::sleep(ms(500)).await;
                f.visibility.set_visible(false);
                assert_eq!(f.polling.armed(), 0);

                tokio::time::sleep(ms(1100)).await;
                assert!(f.invalidated.borrow().is_empty());

                f.visibility.set_visible(true);
                assert_eq!(*f.invalidated.borrow(), vec![hash("a")]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_with_remaining_time() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.existing.borrow_mut().insert(hash("a"));
                f.polling.setup_timer(&hash("a"), ms(1000));

                tokio::time::sleep(ms(200)).await;
                f.visibility.set_visible(false);
                tokio::time::sleep(ms(300)).await;
                f.visibility.set_visible(true);

                // 500ms elapsed, 500ms left on the clock.
                tokio::time::sleep(ms(499)).await;
                assert!(f.invalidated.borrow().is_empty());
                tokio::time::sleep(ms(2)).await;
                assert_eq!(*f.invalidated.borrow(), vec![hash("a")]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_queries_are_ignored() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.polling.setup_timer(&hash("missing"), ms(100));
                assert_eq!(f.polling.armed(), 0);

                f.existing.borrow_mut().insert(hash("gone"));
                f.polling.setup_timer(&hash("gone"), ms(100));
                f.existing.borrow_mut().clear();
                tokio::time::sleep(ms(200)).await;
                settle().await;
                assert!(f.invalidated.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_a_missing_query_drops_its_timer() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.existing.borrow_mut().insert(hash("a"));
                f.polling.setup_timer(&hash("a"), ms(100));
                assert_eq!(f.polling.armed(), 1);

                f.existing.borrow_mut().clear();
                f.polling.setup_timer(&hash("a"), ms(100));
                assert_eq!(f.polling.armed(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn clean_and_restart() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let f = fixture();
                f.existing.borrow_mut().insert(hash("a"));

                f.polling.setup_timer(&hash("a"), ms(100));
                f.polling.clean(&hash("a"));
                tokio::time::sleep(ms(200)).await;
                assert!(f.invalidated.borrow().is_empty());

                // Nothing to restart once cleaned.
                f.polling.restart(&hash("a"));
                assert_eq!(f.polling.armed(), 0);

                f.polling.setup_timer(&hash("a"), ms(100));
                tokio::time::sleep(ms(60)).await;
                f.polling.restart(&hash("a"));
                tokio::time::sleep(ms(60)).await;
                assert!(f.invalidated.borrow().is_empty());
                tokio::time::sleep(ms(41)).await;
                assert_eq!(*f.invalidated.borrow(), vec![hash("a")]);
            })
            .await;
    }
}
