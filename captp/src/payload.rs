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

//! Call and return payloads.
//!
//! The body of a payload belongs to the host's schema codec; this crate
//! never looks inside it. The one thing the session needs from a body is the
//! ability to follow a pipeline path (a sequence of field indices) to a slot
//! in the payload's capability table, which is what [`Content::cap_slot`]
//! provides.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::capability::ClientHook;

/// A codec-owned payload body.
pub trait Content {
    /// Maps a pipeline path to an index in the payload's cap table, or
    /// `None` if the path does not address a capability.
    fn cap_slot(&self, transform: &[u16]) -> crate::Result<Option<u32>>;

    /// Host-side downcast escape hatch.
    fn as_any(&self) -> &dyn Any;
}

pub type Body = Rc<dyn Content>;

/// A payload body plus the capabilities it references.
pub struct Payload {
    pub body: Body,
    pub cap_table: Vec<Box<dyn ClientHook>>,
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            cap_table: self.cap_table.clone(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("cap_table", &self.cap_table)
            .finish()
    }
}

impl Payload {
    pub fn new(body: Body, cap_table: Vec<Box<dyn ClientHook>>) -> Self {
        Self { body, cap_table }
    }

    /// A payload with no data and no capabilities.
    pub fn empty() -> Self {
        Self {
            body: Rc::new(EmptyContent),
            cap_table: Vec::new(),
        }
    }

    /// A payload whose root is a single capability, addressed by the empty
    /// pipeline path. This is the shape of a bootstrap return.
    pub fn capability(cap: Box<dyn ClientHook>) -> Self {
        Self {
            body: Rc::new(CapabilityContent),
            cap_table: vec![cap],
        }
    }

    /// Follows a pipeline path to a capability. Paths that miss resolve to a
    /// broken capability rather than an error, matching how pipelined calls
    /// on a bad path must fail individually.
    pub fn cap_at(&self, transform: &[u16]) -> Box<dyn ClientHook> {
        match self.body.cap_slot(transform) {
            Err(e) => crate::broken::new_cap(e),
            Ok(None) => crate::broken::new_cap(crate::Error::exception(format!(
                "pipeline path {transform:?} does not address a capability"
            ))),
            Ok(Some(slot)) => match self.cap_table.get(slot as usize) {
                Some(cap) => cap.add_ref(),
                None => crate::broken::new_cap(crate::Error::exception(format!(
                    "capability table has no slot {slot}"
                ))),
            },
        }
    }
}

struct EmptyContent;

impl Content for EmptyContent {
    fn cap_slot(&self, _transform: &[u16]) -> crate::Result<Option<u32>> {
        Ok(None)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CapabilityContent;

impl Content for CapabilityContent {
    fn cap_slot(&self, transform: &[u16]) -> crate::Result<Option<u32>> {
        if transform.is_empty() {
            Ok(Some(0))
        } else {
            Ok(None)
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::Payload;

    #[test]
    fn empty_payload_has_no_caps() {
        let p = Payload::empty();
        let cap = p.cap_at(&[]);
        let r = cap.call(0, 0, Payload::empty());
        assert!(r.response().unwrap().is_err());
    }

    #[test]
    fn capability_payload_roots_at_the_empty_path() {
        let p = Payload::capability(crate::broken::null());
        assert_eq!(p.body.cap_slot(&[]).unwrap(), Some(0));
        assert_eq!(p.body.cap_slot(&[1]).unwrap(), None);
    }
}
