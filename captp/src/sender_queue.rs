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

use std::collections::BTreeMap;

/// An ordered buffer of operations waiting for some resolution event.
///
/// Entries drain in insertion order. The promise graph uses one of these per
/// unresolved object, both for queued calls and for resolution waiters.
pub struct SenderQueue<In> {
    next_id: u64,
    map: BTreeMap<u64, In>,
}

impl<In> SenderQueue<In> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            map: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, value: In) {
        self.map.insert(self.next_id, value);
        self.next_id += 1;
    }

    pub fn drain(&mut self) -> Vec<In> {
        self.next_id = 0;
        std::mem::take(&mut self.map).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SenderQueue;

    #[test]
    fn drains_in_insertion_order() {
        let mut q = SenderQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.drain(), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
        q.push(9);
        assert_eq!(q.drain(), vec![9]);
    }
}
