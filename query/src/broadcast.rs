use std::{cell::RefCell, rc::Rc};

use slotmap::SlotMap;

/// Name of the channel shared by every tab of an origin.
pub const CHANNEL_NAME: &str = "leptos_query_cache";

/// Messaging capability used to mirror cache state across tabs.
///
/// Messages posted through one handle reach the subscribers of every other handle on the same
/// channel, never the sender's own.
pub trait BroadcastChannel {
    /// Posts a text message to the other participants.
    fn post_message(&self, message: &str);

    /// Registers a callback for incoming messages.
    fn subscribe(&self, listener: Rc<dyn Fn(&str)>);
}

slotmap::new_key_type! {
    struct PortKey;
}

type Listeners = Vec<Rc<dyn Fn(&str)>>;

/// In-process channel. Each [`port`](LocalBroadcastChannel::port) acts as one tab.
#[derive(Clone, Default)]
pub struct LocalBroadcastChannel {
    ports: Rc<RefCell<SlotMap<PortKey, Listeners>>>,
}

impl LocalBroadcastChannel {
    /// A channel without participants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new participant on this channel.
    pub fn port(&self) -> LocalBroadcastPort {
        let key = self
            .ports
            .try_borrow_mut()
            .expect("port borrow_mut")
            .insert(Vec::new());
        LocalBroadcastPort {
            key,
            channel: self.clone(),
        }
    }
}

/// One participant of a [`LocalBroadcastChannel`]. Delivery is synchronous.
pub struct LocalBroadcastPort {
    key: PortKey,
    channel: LocalBroadcastChannel,
}

impl BroadcastChannel for LocalBroadcastPort {
    fn post_message(&self, message: &str) {
        let listeners = self
            .channel
            .ports
            .try_borrow()
            .expect("post_message borrow")
            .iter()
            .filter(|(key, _)| *key != self.key)
            .flat_map(|(_, listeners)| listeners.iter().cloned())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(message);
        }
    }

    fn subscribe(&self, listener: Rc<dyn Fn(&str)>) {
        if let Some(listeners) = self
            .channel
            .ports
            .try_borrow_mut()
            .expect("subscribe borrow_mut")
            .get_mut(self.key)
        {
            listeners.push(listener);
        }
    }
}

impl Drop for LocalBroadcastPort {
    fn drop(&mut self) {
        if let Ok(mut ports) = self.channel.ports.try_borrow_mut() {
            ports.remove(self.key);
        }
    }
}

#[cfg(feature = "csr")]
pub use web::WebBroadcastChannel;

#[cfg(feature = "csr")]
mod web {
    use std::rc::Rc;

    use wasm_bindgen::{closure::Closure, JsCast};

    use super::{BroadcastChannel, CHANNEL_NAME};

    /// The browser's `BroadcastChannel`.
    pub struct WebBroadcastChannel {
        channel: web_sys::BroadcastChannel,
    }

    impl WebBroadcastChannel {
        /// `None` where the browser offers no broadcast channel.
        pub fn new() -> Option<Self> {
            match web_sys::BroadcastChannel::new(CHANNEL_NAME) {
                Ok(channel) => Some(Self { channel }),
                Err(_) => {
                    leptos::logging::debug_warn!(
                        "BroadcastChannel unavailable, cross-tab synchronization is disabled."
                    );
                    None
                }
            }
        }
    }

    impl BroadcastChannel for WebBroadcastChannel {
        fn post_message(&self, message: &str) {
            if let Err(error) = self
                .channel
                .post_message(&wasm_bindgen::JsValue::from_str(message))
            {
                leptos::logging::warn!("Failed to broadcast cache update: {:?}", error);
            }
        }

        fn subscribe(&self, listener: Rc<dyn Fn(&str)>) {
            let closure = Closure::wrap(Box::new(move |event: web_sys::MessageEvent| {
                if let Some(message) = event.data().as_string() {
                    listener(&message);
                }
            }) as Box<dyn FnMut(_)>)
            .into_js_value();
            if self
                .channel
                .add_event_listener_with_callback("message", closure.unchecked_ref())
                .is_err()
            {
                leptos::logging::warn!("Failed to listen for cache updates from other tabs.");
            }
        }
    }
}
