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

//! The four-table protocol state machine.
//!
//! [`ConnectionState`] is pure bookkeeping: methods take semantic inputs and
//! return frames or effect values for the session layer to act on. Nothing
//! here touches a transport.

use std::collections::HashMap;
use std::rc::Weak;

use crate::capability::ClientHook;
use crate::message::{
    AnswerId, CapDescriptor, EmbargoId, ExportId, Frame, ImportId, MessageTarget, PipelinePath,
    QuestionId,
};
use crate::queued::{StructRef, StructResolver};
use crate::session::ImportInner;
use crate::table::{Allocating, Tracking};

/// A call we sent: born on send, dies once the return has been received and
/// the finish has gone out.
pub(crate) struct Question {
    pub resolver: StructResolver,
    /// Paths on which pipelined calls were actually put on the wire. These
    /// are what make the embargo promotion necessary on return.
    pub pipelined: Vec<PipelinePath>,
    pub finish_sent: bool,
    pub return_received: bool,
}

/// A call the peer sent: born on receipt, dies once the return has been sent
/// and the finish received.
pub(crate) struct Answer {
    /// Read end of the answer promise; pipelined targets resolve through it.
    pub answer_ref: StructRef,
    pub resolver: StructResolver,
    pub return_sent: bool,
    pub finished: bool,
    /// Exports allocated while sending the return, releasable by a finish
    /// with `releaseResultCaps`.
    pub exports_in_return: Vec<ExportId>,
}

pub(crate) struct Export {
    pub cap: Box<dyn ClientHook>,
    /// How many references the peer believes it holds.
    pub wire_ref_count: u32,
}

pub(crate) struct ImportEntry {
    pub proxy: Weak<ImportInner>,
    pub ptr: usize,
}

pub(crate) struct EmbargoEntry {
    /// Identity of the capability the embargo protects.
    pub ptr: usize,
}

/// A translated inbound capability descriptor, one step short of a
/// user-visible capability (the session materializes proxies).
pub(crate) enum RecvCap {
    None,
    Local {
        cap: Box<dyn ClientHook>,
        /// True when the descriptor addressed one of our exports directly;
        /// only those are candidates for the loopback embargo.
        loopback: bool,
    },
    Imported {
        id: ImportId,
        is_promise: bool,
    },
}

/// What a received finish asks of the session.
pub(crate) enum FinishAction {
    /// The call has not returned yet: cancel it.
    Cancel(StructResolver),
    /// The answer is fully retired; drop these outside the state borrow.
    Completed {
        answer: Answer,
        released: Vec<Box<dyn ClientHook>>,
    },
}

pub(crate) struct ConnectionState {
    pub questions: Allocating<Question>,
    pub answers: Tracking<Answer>,
    pub exports: Allocating<Export>,
    pub imports: Tracking<ImportEntry>,
    pub embargoes: Allocating<EmbargoEntry>,
    exports_by_cap: HashMap<usize, ExportId>,
}

pub(crate) struct Teardown {
    pub resolvers: Vec<StructResolver>,
    pub answers: Vec<Answer>,
    pub caps: Vec<Box<dyn ClientHook>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            questions: Allocating::new(),
            answers: Tracking::new(),
            exports: Allocating::new(),
            imports: Tracking::new(),
            embargoes: Allocating::new(),
            exports_by_cap: HashMap::new(),
        }
    }

    pub fn init_question(&mut self, resolver: StructResolver) -> QuestionId {
        self.questions.alloc(|_| Question {
            resolver,
            pipelined: Vec::new(),
            finish_sent: false,
            return_received: false,
        })
    }

    pub fn record_pipelined_send(&mut self, question_id: QuestionId, transform: &[u16]) {
        if let Some(q) = self.questions.find_mut(question_id) {
            if !q.pipelined.iter().any(|p| p.as_slice() == transform) {
                q.pipelined.push(PipelinePath::from_slice(transform));
            }
        }
    }

    /// Relinquishes our question. Emits the finish frame, with
    /// `releaseResultCaps` set when we are cancelling before the return.
    pub fn finish_question(&mut self, question_id: QuestionId) -> Option<Frame> {
        let release = match self.questions.find_mut(question_id) {
            None => return None,
            Some(q) => {
                if q.finish_sent {
                    return None;
                }
                q.finish_sent = true;
                !q.return_received
            }
        };
        if !release {
            // Return already received: both halves of the lifecycle are done.
            let _ = self.questions.release(question_id);
        }
        Some(Frame::Finish {
            question_id,
            release_result_caps: release,
        })
    }

    /// Accepts a return for one of our questions. `None` means the question
    /// was already cancelled and the return is to be dropped on the floor.
    pub fn take_return(
        &mut self,
        question_id: QuestionId,
    ) -> crate::Result<Option<(StructResolver, Vec<PipelinePath>)>> {
        let finished = {
            let q = self.questions.get_mut(question_id)?;
            if q.return_received {
                return Err(crate::Error::protocol(format!(
                    "duplicate return for question {question_id}"
                )));
            }
            q.return_received = true;
            q.finish_sent
        };
        if finished {
            let _ = self.questions.release(question_id);
            return Ok(None);
        }
        let q = self.questions.get(question_id)?;
        Ok(Some((q.resolver.clone(), q.pipelined.clone())))
    }

    pub fn init_answer(
        &mut self,
        answer_id: AnswerId,
        answer_ref: StructRef,
        resolver: StructResolver,
    ) -> crate::Result<()> {
        self.answers.set(
            answer_id,
            Answer {
                answer_ref,
                resolver,
                return_sent: false,
                finished: false,
                exports_in_return: Vec::new(),
            },
        )
    }

    /// Checks and marks that a return is about to be sent for `answer_id`.
    pub fn begin_return(&mut self, answer_id: AnswerId) -> crate::Result<()> {
        let a = self.answers.get_mut(answer_id)?;
        if a.return_sent {
            return Err(crate::Error::protocol(format!(
                "return sent twice for answer {answer_id}"
            )));
        }
        a.return_sent = true;
        Ok(())
    }

    pub fn note_return_exports(&mut self, answer_id: AnswerId, exports: Vec<ExportId>) {
        if let Some(a) = self.answers.find_mut(answer_id) {
            a.exports_in_return = exports;
        }
    }

    /// Retires the answer if both the return and the finish have happened.
    pub fn answer_done(&mut self, answer_id: AnswerId) -> Option<Answer> {
        let done = match self.answers.find(answer_id) {
            Some(a) => a.return_sent && a.finished,
            None => false,
        };
        if done {
            self.answers.release(answer_id).ok()
        } else {
            None
        }
    }

    pub fn handle_finish(
        &mut self,
        answer_id: AnswerId,
        release_result_caps: bool,
    ) -> crate::Result<FinishAction> {
        let returned = {
            let a = self.answers.get_mut(answer_id)?;
            if a.finished {
                return Err(crate::Error::protocol(format!(
                    "duplicate finish for answer {answer_id}"
                )));
            }
            a.finished = true;
            a.return_sent
        };
        if !returned {
            let a = self.answers.get(answer_id)?;
            return Ok(FinishAction::Cancel(a.resolver.clone()));
        }
        let answer = self.answers.release(answer_id)?;
        let mut released = Vec::new();
        if release_result_caps {
            for id in &answer.exports_in_return {
                if let Some(cap) = self.release_export(*id, 1)? {
                    released.push(cap);
                }
            }
        }
        Ok(FinishAction::Completed { answer, released })
    }

    /// Describes a local capability to the peer, allocating an export slot
    /// the first time and bumping the wire count every time.
    pub fn export(&mut self, cap: Box<dyn ClientHook>) -> ExportId {
        let ptr = cap.get_ptr();
        let id = match self.exports_by_cap.get(&ptr) {
            Some(&id) => id,
            None => {
                let id = self.exports.alloc(|_| Export {
                    cap,
                    wire_ref_count: 0,
                });
                self.exports_by_cap.insert(ptr, id);
                id
            }
        };
        if let Some(e) = self.exports.find_mut(id) {
            e.wire_ref_count += 1;
        }
        id
    }

    /// Drops `count` wire references from an export. At zero the export slot
    /// is reclaimed and the capability is handed back for dropping.
    pub fn release_export(
        &mut self,
        id: ExportId,
        count: u32,
    ) -> crate::Result<Option<Box<dyn ClientHook>>> {
        let remaining = {
            let e = self.exports.get_mut(id)?;
            if count > e.wire_ref_count {
                return Err(crate::Error::protocol(format!(
                    "release of export {id} exceeds its reference count"
                )));
            }
            e.wire_ref_count -= count;
            e.wire_ref_count
        };
        if remaining > 0 {
            return Ok(None);
        }
        let export = self.exports.release(id)?;
        self.exports_by_cap.remove(&export.cap.get_ptr());
        Ok(Some(export.cap))
    }

    /// Resolves an inbound message target to the capability it addresses.
    pub fn call_target(&self, target: &MessageTarget) -> crate::Result<Box<dyn ClientHook>> {
        match target {
            MessageTarget::ImportedCap(id) => Ok(self.exports.get(*id)?.cap.add_ref()),
            MessageTarget::PromisedAnswer {
                question_id,
                transform,
            } => {
                let a = self.answers.get(*question_id)?;
                Ok(a.answer_ref.cap(transform).hook)
            }
        }
    }

    /// Translates one inbound capability descriptor. `in_return` applies the
    /// restrictions on return payloads.
    pub fn recv_cap(&mut self, desc: &CapDescriptor, in_return: bool) -> crate::Result<RecvCap> {
        match desc {
            CapDescriptor::None => Ok(RecvCap::None),
            CapDescriptor::SenderHosted(id) => Ok(RecvCap::Imported {
                id: *id,
                is_promise: false,
            }),
            CapDescriptor::SenderPromise(id) => Ok(RecvCap::Imported {
                id: *id,
                is_promise: true,
            }),
            CapDescriptor::ReceiverHosted(id) => Ok(RecvCap::Local {
                cap: self.exports.get(*id)?.cap.add_ref(),
                loopback: true,
            }),
            CapDescriptor::ReceiverAnswer {
                question_id,
                transform,
            } => {
                if in_return {
                    return Err(crate::Error::protocol(
                        "receiverAnswer capabilities are not supported in return payloads",
                    ));
                }
                let a = self.answers.get(*question_id)?;
                Ok(RecvCap::Local {
                    cap: a.answer_ref.cap(transform).hook,
                    loopback: false,
                })
            }
            CapDescriptor::ThirdPartyHosted => Err(crate::Error::protocol(
                "thirdPartyHosted capabilities are not supported (level 3)",
            )),
        }
    }

    pub fn alloc_embargo(&mut self, ptr: usize) -> EmbargoId {
        self.embargoes.alloc(|_| EmbargoEntry { ptr })
    }

    pub fn take_embargo(&mut self, id: EmbargoId) -> crate::Result<usize> {
        Ok(self.embargoes.release(id)?.ptr)
    }

    /// Rips every table down for session teardown. The session resolves the
    /// returned resolvers and drops the rest outside its state borrow.
    pub fn teardown(&mut self) -> Teardown {
        let mut resolvers = Vec::new();
        let mut caps = Vec::new();
        for (_, q) in self.questions.drain() {
            resolvers.push(q.resolver);
        }
        let answers = self
            .answers
            .drain()
            .into_iter()
            .map(|(_, a)| a)
            .collect::<Vec<_>>();
        for (_, e) in self.exports.drain() {
            caps.push(e.cap);
        }
        self.imports.drain();
        self.embargoes.drain();
        self.exports_by_cap.clear();
        Teardown {
            resolvers,
            answers,
            caps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState;
    use crate::message::Frame;
    use crate::queued::StructRef;

    #[test]
    fn question_lives_until_return_and_finish() {
        let mut state = ConnectionState::new();
        let (_sref, resolver) = StructRef::new_pair();
        let qid = state.init_question(resolver);

        // Return first, then finish.
        assert!(state.take_return(qid).unwrap().is_some());
        assert!(state.questions.find(qid).is_some());
        match state.finish_question(qid) {
            Some(Frame::Finish {
                release_result_caps,
                ..
            }) => assert!(!release_result_caps),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(state.questions.find(qid).is_none());
    }

    #[test]
    fn finish_before_return_releases_result_caps() {
        let mut state = ConnectionState::new();
        let (_sref, resolver) = StructRef::new_pair();
        let qid = state.init_question(resolver);

        match state.finish_question(qid) {
            Some(Frame::Finish {
                release_result_caps,
                ..
            }) => assert!(release_result_caps),
            other => panic!("unexpected frame: {other:?}"),
        }
        // The slot stays to absorb the eventual return, which is dropped.
        assert!(state.take_return(qid).unwrap().is_none());
        assert!(state.questions.find(qid).is_none());
    }

    #[test]
    fn duplicate_return_is_a_protocol_error() {
        let mut state = ConnectionState::new();
        let (_sref, resolver) = StructRef::new_pair();
        let qid = state.init_question(resolver);
        state.take_return(qid).unwrap();
        assert!(state.take_return(qid).is_err());
    }

    #[test]
    fn export_reuses_slots_and_counts_wire_refs() {
        let mut state = ConnectionState::new();
        let cap = crate::broken::null();
        let id1 = state.export(cap.add_ref());
        let id2 = state.export(cap.add_ref());
        assert_eq!(id1, id2);
        assert_eq!(state.exports.get(id1).unwrap().wire_ref_count, 2);

        assert!(state.release_export(id1, 1).unwrap().is_none());
        assert!(state.release_export(id1, 1).unwrap().is_some());
        assert!(state.exports.find(id1).is_none());
        assert!(state.release_export(id1, 1).is_err());
    }

    #[test]
    fn over_release_is_a_protocol_error() {
        let mut state = ConnectionState::new();
        let id = state.export(crate::broken::null());
        assert!(state.release_export(id, 2).is_err());
    }
}
