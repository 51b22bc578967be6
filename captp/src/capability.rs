// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The capability abstraction.
//!
//! A capability is a `Box<dyn ClientHook>`. Boxes are reference counts:
//! `add_ref` (and `Clone`) increment, `Drop` decrements, and whatever a hook
//! needs to do at zero happens in its own destructor — an import proxy, for
//! example, emits a `Release` frame from there.

use core::future::Future;
use core::pin::Pin;
use core::task::Poll;
use std::fmt;

use crate::payload::Payload;
use crate::queued::StructRef;

/// A computation that might eventually resolve to a value of type `T` or to
/// an error of type `E`. Dropping the promise cancels the computation.
#[must_use = "futures do nothing unless polled"]
pub struct Promise<T, E> {
    inner: PromiseInner<T, E>,
}

enum PromiseInner<T, E> {
    Immediate(Result<T, E>),
    Deferred(Pin<Box<dyn Future<Output = core::result::Result<T, E>> + 'static>>),
    Empty,
}

// Allow Promise<T,E> to be Unpin, regardless of whether T and E are.
impl<T, E> Unpin for PromiseInner<T, E> {}

impl<T, E> Promise<T, E> {
    pub fn ok(value: T) -> Self {
        Self {
            inner: PromiseInner::Immediate(Ok(value)),
        }
    }

    pub fn err(error: E) -> Self {
        Self {
            inner: PromiseInner::Immediate(Err(error)),
        }
    }

    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = core::result::Result<T, E>> + 'static,
    {
        Self {
            inner: PromiseInner::Deferred(Box::pin(f)),
        }
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = core::result::Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut ::core::task::Context) -> Poll<Self::Output> {
        match self.get_mut().inner {
            PromiseInner::Empty => panic!("Promise polled after done."),
            ref mut imm @ PromiseInner::Immediate(_) => {
                match core::mem::replace(imm, PromiseInner::Empty) {
                    PromiseInner::Immediate(r) => Poll::Ready(r),
                    _ => unreachable!(),
                }
            }
            PromiseInner::Deferred(ref mut f) => f.as_mut().poll(cx),
        }
    }
}

/// A callback handed to [`ClientHook::when_more_resolved`], invoked with the
/// next hop once the hook resolves one step further.
pub type ResolveWaiter = Box<dyn FnOnce(Box<dyn ClientHook>)>;

/// The object behind a capability handle.
pub trait ClientHook {
    fn add_ref(&self) -> Box<dyn ClientHook>;

    /// Starts a call. Ownership of `params` (including its cap table)
    /// transfers to the callee.
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> StructRef;

    /// The capability at `transform` within whatever this one resolves to.
    fn get_pipelined_cap(&self, transform: &[u16]) -> Box<dyn ClientHook>;

    /// One shortening hop, if this hook has already resolved to another.
    fn get_resolved(&self) -> Option<Box<dyn ClientHook>>;

    /// Registers `waiter` to fire when this hook resolves one more step.
    /// A hook that is already settled hands the waiter back instead.
    fn when_more_resolved(&self, waiter: ResolveWaiter) -> Option<ResolveWaiter>;

    /// True while this hook is an unresolved promise.
    fn is_promise(&self) -> bool;

    /// True for the null capability (described on the wire as `none`).
    fn is_null(&self) -> bool;

    /// A stable identity for this capability, shared by all of its refs.
    /// Keys the round-trip and embargo maps.
    fn get_ptr(&self) -> usize;
}

impl Clone for Box<dyn ClientHook> {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

impl fmt::Debug for dyn ClientHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap({:#x})", self.get_ptr())
    }
}

/// The most direct known representation of `hook`: follows resolved hops
/// until one does not shorten further. Resolvers refuse to create chains
/// through themselves, so this terminates.
pub fn shortest(hook: &dyn ClientHook) -> Box<dyn ClientHook> {
    let mut current = hook.add_ref();
    while let Some(next) = current.get_resolved() {
        current = next;
    }
    current
}

pub(crate) fn settled_pipeline(hook: &dyn ClientHook, transform: &[u16]) -> Box<dyn ClientHook> {
    if transform.is_empty() {
        hook.add_ref()
    } else {
        crate::broken::new_cap(crate::Error::exception(
            "capability result does not have fields to pipeline into",
        ))
    }
}

/// An untyped capability handle.
pub struct Client {
    pub hook: Box<dyn ClientHook>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }
}

impl Client {
    pub fn new(hook: Box<dyn ClientHook>) -> Self {
        Self { hook }
    }

    /// Calls the method identified by `(interface_id, method_id)`. Returns
    /// immediately with a handle for the (possibly unresolved) result.
    pub fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> StructRef {
        self.hook.call(interface_id, method_id, params)
    }

    /// The sub-capability at `transform` within this capability's eventual
    /// resolution. Valid even while this capability is a promise.
    pub fn cap(&self, transform: &[u16]) -> Client {
        Client::new(self.hook.get_pipelined_cap(transform))
    }

    pub fn shortest(&self) -> Client {
        Client::new(shortest(&*self.hook))
    }

    /// Runs `f` with the settled form of this capability, synchronously if
    /// it is already settled. Mainly useful for identity checks; there is no
    /// need to wait before making calls.
    pub fn when_resolved<F>(&self, f: F)
    where
        F: FnOnce(Client) + 'static,
    {
        fn wait(hook: Box<dyn ClientHook>, f: Box<dyn FnOnce(Client)>) {
            if let Some(next) = hook.get_resolved() {
                return wait(next, f);
            }
            if !hook.is_promise() {
                return f(Client::new(hook));
            }
            // An unresolved promise always registers the waiter.
            let leftover = hook.when_more_resolved(Box::new(move |next| wait(next, f)));
            debug_assert!(leftover.is_none());
        }
        wait(self.hook.add_ref(), Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::shortest;

    #[test]
    fn shortest_is_idempotent_on_settled_caps() {
        let cap = crate::broken::null();
        let s1 = shortest(&*cap);
        let s2 = shortest(&*s1);
        assert_eq!(s1.get_ptr(), s2.get_ptr());
        assert_eq!(s1.get_ptr(), cap.get_ptr());
    }

    #[test]
    fn when_resolved_fires_synchronously_for_settled_caps() {
        let client = crate::Client::new(crate::broken::null());
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired2 = fired.clone();
        client.when_resolved(move |_| fired2.set(true));
        assert!(fired.get());
    }
}
