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

//! Capabilities that answer every call with the same error.

use std::rc::Rc;

use crate::capability::{ClientHook, ResolveWaiter};
use crate::payload::Payload;
use crate::queued::StructRef;

struct Inner {
    error: crate::Error,
    is_null: bool,
}

pub struct Client {
    inner: Rc<Inner>,
}

impl Client {
    fn make(error: crate::Error, is_null: bool) -> Self {
        Self {
            inner: Rc::new(Inner { error, is_null }),
        }
    }
}

/// A capability broken by `error`.
pub fn new_cap(error: crate::Error) -> Box<dyn ClientHook> {
    Box::new(Client::make(error, false))
}

/// The null capability.
pub fn null() -> Box<dyn ClientHook> {
    Box::new(Client::make(
        crate::Error::exception("called null capability"),
        true,
    ))
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(Self {
            inner: self.inner.clone(),
        })
    }

    fn call(&self, _interface_id: u64, _method_id: u16, _params: Payload) -> StructRef {
        StructRef::error(self.inner.error.clone())
    }

    fn get_pipelined_cap(&self, _transform: &[u16]) -> Box<dyn ClientHook> {
        // Anything pipelined out of a broken capability fails the same way.
        self.add_ref()
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
        self.inner.is_null
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}
