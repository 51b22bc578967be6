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

//! Frame transports for connecting two sessions in one process.
//!
//! [`Pipe`] is a deterministic queue for tests and hosts that pump frames
//! themselves; [`channel`] plus [`drive`] run a session over tokio channels.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::mpsc;

use crate::message::Frame;
use crate::session::{FrameSender, Session};

/// An in-process frame queue. Cloning yields another handle on the same
/// queue; whoever holds one pops frames and feeds them to the other side.
pub struct Pipe {
    queue: Rc<RefCell<VecDeque<Frame>>>,
}

impl Clone for Pipe {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn pop(&self) -> Option<Frame> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSender for Pipe {
    fn queue_send(&self, frame: Frame) {
        self.queue.borrow_mut().push_back(frame);
    }
}

/// A frame sink over a tokio unbounded channel.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender for ChannelSender {
    fn queue_send(&self, frame: Frame) {
        // A closed receiver means the peer task is gone; frames sent after
        // that are dropped, matching a closed transport.
        let _ = self.tx.send(frame);
    }
}

/// A connected `(sink, source)` pair for one direction of a connection.
pub fn channel() -> (ChannelSender, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSender { tx }, rx)
}

/// Feeds `session` from `source` until end-of-stream or a protocol error,
/// then tears the session down.
pub async fn drive(
    session: &Session,
    source: &mut mpsc::UnboundedReceiver<Frame>,
) -> crate::Result<()> {
    while let Some(frame) = source.recv().await {
        session.handle_frame(frame)?;
    }
    session.abort(crate::Error::disconnected("transport closed"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Pipe;
    use crate::message::Frame;
    use crate::session::FrameSender;

    #[test]
    fn pipe_preserves_order() {
        let pipe = Pipe::new();
        pipe.queue_send(Frame::Bootstrap { question_id: 0 });
        pipe.queue_send(Frame::Finish {
            question_id: 0,
            release_result_caps: false,
        });
        assert_eq!(pipe.len(), 2);
        assert!(matches!(pipe.pop(), Some(Frame::Bootstrap { .. })));
        assert!(matches!(pipe.pop(), Some(Frame::Finish { .. })));
        assert!(pipe.pop().is_none());
    }
}
