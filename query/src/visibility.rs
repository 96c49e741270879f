use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use slotmap::SlotMap;

/// Page visibility capability used by polling.
pub trait DocumentVisibility {
    /// Whether the page is currently visible.
    fn is_visible(&self) -> bool;

    /// Registers a callback for every visibility change. It receives the new visibility.
    fn on_visibility_change(&self, listener: Rc<dyn Fn(bool)>);
}

slotmap::new_key_type! {
    struct ListenerKey;
}

/// Visibility driven by hand, for runtimes without a document.
#[derive(Clone)]
pub struct ManualVisibility {
    visible: Rc<Cell<bool>>,
    listeners: Rc<RefCell<SlotMap<ListenerKey, Rc<dyn Fn(bool)>>>>,
}

impl Default for ManualVisibility {
    fn default() -> Self {
        Self {
            visible: Rc::new(Cell::new(true)),
            listeners: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }
}

impl ManualVisibility {
    /// Starts visible.
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes visibility and notifies listeners if it actually changed.
    pub fn set_visible(&self, visible: bool) {
        if self.visible.replace(visible) == visible {
            return;
        }
        let listeners = self
            .listeners
            .try_borrow()
            .expect("set_visible borrow")
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(visible);
        }
    }
}

impl DocumentVisibility for ManualVisibility {
    fn is_visible(&self) -> bool {
        self.visible.get()
    }

    fn on_visibility_change(&self, listener: Rc<dyn Fn(bool)>) {
        self.listeners
            .try_borrow_mut()
            .expect("on_visibility_change borrow_mut")
            .insert(listener);
    }
}

#[cfg(feature = "csr")]
pub use web::WebVisibility;

#[cfg(feature = "csr")]
mod web {
    use std::rc::Rc;

    use wasm_bindgen::{closure::Closure, JsCast};

    use super::DocumentVisibility;

    /// Visibility of the browser document.
    #[derive(Clone)]
    pub struct WebVisibility {
        document: web_sys::Document,
    }

    impl WebVisibility {
        /// `None` outside a browser window.
        pub fn new() -> Option<Self> {
            let document = web_sys::window()?.document()?;
            Some(Self { document })
        }
    }

    impl DocumentVisibility for WebVisibility {
        fn is_visible(&self) -> bool {
            self.document.visibility_state() == web_sys::VisibilityState::Visible
        }

        fn on_visibility_change(&self, listener: Rc<dyn Fn(bool)>) {
            let document = self.document.clone();
            let closure = Closure::wrap(Box::new(move || {
                listener(document.visibility_state() == web_sys::VisibilityState::Visible)
            }) as Box<dyn FnMut()>)
            .into_js_value();
            if self
                .document
                .add_event_listener_with_callback("visibilitychange", closure.unchecked_ref())
                .is_err()
            {
                leptos::logging::warn!("Failed to listen for visibility changes.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifies_only_on_change() {
        let visibility = ManualVisibility::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        visibility.on_visibility_change(Rc::new({
            let calls = calls.clone();
            move |visible| calls.borrow_mut().push(visible)
        }));

        visibility.set_visible(true);
        assert!(calls.borrow().is_empty());

        visibility.set_visible(false);
        assert!(!visibility.is_visible());
        visibility.set_visible(false);
        visibility.set_visible(true);
        assert_eq!(*calls.borrow(), vec![false, true]);
    }
}
