// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Single-slot state-change notification.

use std::sync::Mutex;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// At-most-one registered listener, invoked synchronously with every
/// published snapshot. No batching, no filtering.
///
/// The listener must be cheap (enqueue a redraw, push onto a channel) and
/// must not call back into the publishing component: delivery happens on
/// the publisher's task and a synchronous re-entry would recurse into
/// snapshot replacement.
pub struct Notifier<T> {
    listener: Mutex<Option<Listener<T>>>,
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    /// Register the listener, replacing any previous one.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(Box::new(listener));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = None;
        }
    }

    pub fn notify(&self, snapshot: &T) {
        if let Ok(slot) = self.listener.lock() {
            if let Some(listener) = slot.as_ref() {
                listener(snapshot);
            }
        }
    }
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}
