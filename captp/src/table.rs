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

//! Dense tables of connection-scoped identifiers.

use std::collections::HashMap;

/// A table whose ids we allocate: questions, exports, embargoes.
///
/// Released ids go on a free list and are handed out again before `next`
/// advances, keeping the id space dense. A live id is never on the free list.
pub struct Allocating<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Allocating<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc<F>(&mut self, f: F) -> u32
    where
        F: FnOnce(u32) -> T,
    {
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id as usize].is_none());
                self.slots[id as usize] = Some(f(id));
                id
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Some(f(id)));
                id
            }
        }
    }

    pub fn release(&mut self, id: u32) -> crate::Result<T> {
        match self.slots.get_mut(id as usize).and_then(Option::take) {
            Some(value) => {
                self.free.push(id);
                Ok(value)
            }
            None => Err(crate::Error::protocol(format!(
                "released id {id} is not in the table"
            ))),
        }
    }

    pub fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Like `find`, but a missing id is a protocol error.
    pub fn get(&self, id: u32) -> crate::Result<&T> {
        self.find(id)
            .ok_or_else(|| crate::Error::protocol(format!("unknown id {id}")))
    }

    pub fn get_mut(&mut self, id: u32) -> crate::Result<&mut T> {
        self.find_mut(id)
            .ok_or_else(|| crate::Error::protocol(format!("unknown id {id}")))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.free.clear();
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| slot.take().map(|v| (id as u32, v)))
            .collect()
    }
}

/// A table whose ids the peer assigns: answers, imports.
pub struct Tracking<T> {
    map: HashMap<u32, T>,
}

impl<T> Tracking<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn set(&mut self, id: u32, value: T) -> crate::Result<()> {
        if self.map.insert(id, value).is_some() {
            return Err(crate::Error::protocol(format!("id {id} is already in use")));
        }
        Ok(())
    }

    pub fn release(&mut self, id: u32) -> crate::Result<T> {
        self.map
            .remove(&id)
            .ok_or_else(|| crate::Error::protocol(format!("released id {id} is not in the table")))
    }

    pub fn find(&self, id: u32) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.map.get_mut(&id)
    }

    pub fn get(&self, id: u32) -> crate::Result<&T> {
        self.find(id)
            .ok_or_else(|| crate::Error::protocol(format!("unknown id {id}")))
    }

    pub fn get_mut(&mut self, id: u32) -> crate::Result<&mut T> {
        self.find_mut(id)
            .ok_or_else(|| crate::Error::protocol(format!("unknown id {id}")))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.map.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Allocating, Tracking};

    #[test]
    fn alloc_is_dense_and_recycles() {
        let mut t: Allocating<String> = Allocating::new();
        assert_eq!(t.alloc(|id| format!("v{id}")), 0);
        assert_eq!(t.alloc(|id| format!("v{id}")), 1);
        assert_eq!(t.alloc(|id| format!("v{id}")), 2);
        assert_eq!(t.release(1).unwrap(), "v1");
        assert_eq!(t.alloc(|id| format!("v{id}")), 1);
        assert_eq!(t.find(1).unwrap(), "v1");
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn release_of_unknown_id_is_an_error() {
        let mut t: Allocating<u32> = Allocating::new();
        assert!(t.release(0).is_err());
        let id = t.alloc(|_| 7);
        t.release(id).unwrap();
        assert!(t.release(id).is_err());
    }

    #[test]
    fn tracking_rejects_duplicates() {
        let mut t: Tracking<u32> = Tracking::new();
        t.set(5, 50).unwrap();
        assert!(t.set(5, 51).is_err());
        assert_eq!(t.release(5).unwrap(), 50);
        assert!(t.get(5).is_err());
    }

    quickcheck::quickcheck! {
        // Replaying any alloc/release schedule never hands out an id that is
        // still live, and live ids stay findable.
        fn no_live_id_is_reissued(ops: Vec<bool>) -> bool {
            let mut t: Allocating<u32> = Allocating::new();
            let mut live = std::collections::HashSet::new();
            for op in ops {
                if op || live.is_empty() {
                    let id = t.alloc(|id| id);
                    if !live.insert(id) {
                        return false;
                    }
                } else {
                    let id = *live.iter().next().unwrap();
                    live.remove(&id);
                    if t.release(id).is_err() {
                        return false;
                    }
                }
            }
            live.iter().all(|id| t.find(*id) == Some(id)) && t.len() == live.len()
        }
    }
}
