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

//! In-process services behind capability handles.

use std::rc::Rc;

use crate::capability::{ClientHook, ResolveWaiter};
use crate::payload::Payload;
use crate::queued::StructRef;

/// An untyped server. The dispatch returns a [`StructRef`], so a method body
/// may answer immediately ([`StructRef::ok`] / [`StructRef::error`]) or hand
/// back the read end of a promise it resolves later.
pub trait Server {
    fn dispatch_call(self: Rc<Self>, interface_id: u64, method_id: u16, params: Payload)
        -> StructRef;
}

pub struct Client<S>
where
    S: Server,
{
    inner: Rc<S>,
}

impl<S> Client<S>
where
    S: Server,
{
    pub fn new(server: S) -> Self {
        Self {
            inner: Rc::new(server),
        }
    }

    pub fn from_rc(server: Rc<S>) -> Self {
        Self { inner: server }
    }
}

impl<S> Clone for Client<S>
where
    S: Server,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> ClientHook for Client<S>
where
    S: Server + 'static,
{
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> StructRef {
        self.inner
            .clone()
            .dispatch_call(interface_id, method_id, params)
    }

    fn get_pipelined_cap(&self, transform: &[u16]) -> Box<dyn ClientHook> {
        crate::capability::settled_pipeline(self, transform)
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }

    fn when_more_resolved(&self, waiter: ResolveWaiter) -> Option<ResolveWaiter> {
        Some(waiter)
    }

    fn is_promise(&self) -> bool {
        false
    }

    fn is_null(&self) -> bool {
        false
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::Server;
    use crate::payload::Payload;
    use crate::queued::StructRef;

    struct Counter {
        calls: Cell<u32>,
    }

    impl Server for Counter {
        fn dispatch_call(
            self: Rc<Self>,
            interface_id: u64,
            _method_id: u16,
            _params: Payload,
        ) -> StructRef {
            self.calls.set(self.calls.get() + 1);
            if interface_id == 0 {
                StructRef::error(crate::Error::exception("unknown interface"))
            } else {
                StructRef::ok(Payload::empty())
            }
        }
    }

    #[test]
    fn dispatch_reaches_the_server() {
        let client = crate::new_client(Counter {
            calls: Cell::new(0),
        });
        assert!(matches!(
            client.call(1, 0, Payload::empty()).response(),
            Some(Ok(_))
        ));
        assert!(matches!(
            client.call(0, 0, Payload::empty()).response(),
            Some(Err(_))
        ));
    }

    #[test]
    fn refs_share_identity() {
        let client = crate::new_client(Counter {
            calls: Cell::new(0),
        });
        let other = client.clone();
        assert_eq!(client.hook.get_ptr(), other.hook.get_ptr());
    }
}
