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

//! The session layer: one CapTP connection.
//!
//! A [`Session`] owns the protocol state machine, a frame sink supplied by
//! the transport, the identity-keyed round-trip map, and the embargo map.
//! Inbound frames go through [`Session::handle_frame`]; outbound frames are
//! produced as side effects of user calls and promise resolutions.
//!
//! Import proxies and question references emit their `Release` and `Finish`
//! frames from destructors. A destructor can run while the session is in
//! the middle of a dispatch, so those effects go through a small deferral
//! queue that is flushed at every entry point.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::capability::{self, Client, ClientHook, ResolveWaiter};
use crate::message::{
    CapDescriptor, Disembargo, EmbargoId, Frame, ImportId, MessageTarget, PipelinePath, QuestionId,
    Return, WirePayload,
};
use crate::payload::Payload;
use crate::queued::{self, RemoteHook, StructRef, StructResolver};
use crate::rpc::{ConnectionState, FinishAction, ImportEntry, RecvCap};
use crate::Config;

/// The frame sink supplied by the transport. Must preserve order.
pub trait FrameSender {
    fn queue_send(&self, frame: Frame);
}

/// How a capability of the peer's is known on this connection; the
/// round-trip (`ours`) map resolves cap identity to one of these so a
/// capability sent back to its host is described by reference, not
/// re-exported.
enum WireRef {
    Import(ImportId),
    Answer(QuestionId, PipelinePath),
}

struct EmbargoHold {
    client: queued::Client,
    underlying: Box<dyn ClientHook>,
}

enum Deferred {
    ImportDropped {
        id: ImportId,
        ptr: usize,
        count: u32,
    },
    QuestionDropped(QuestionId),
}

/// Live table counts, exposed for teardown checks and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableCounts {
    pub questions: usize,
    pub answers: usize,
    pub exports: usize,
    pub imports: usize,
    pub embargoes: usize,
}

pub(crate) struct SessionCore {
    me: Weak<SessionCore>,
    state: RefCell<ConnectionState>,
    sender: RefCell<Option<Box<dyn FrameSender>>>,
    ours: RefCell<HashMap<usize, WireRef>>,
    embargoes: RefCell<HashMap<(usize, EmbargoId), EmbargoHold>>,
    deferred: RefCell<VecDeque<Deferred>>,
    bootstrap: Option<Box<dyn ClientHook>>,
    aborted: RefCell<Option<crate::Error>>,
    tags: String,
}

/// One end of a CapTP connection.
pub struct Session {
    core: Rc<SessionCore>,
}

impl Session {
    pub fn new(sender: Box<dyn FrameSender>, config: Config) -> crate::Result<Session> {
        if config.allow_third_party_tail_call {
            return Err(crate::Error::protocol(
                "third-party tail calls are not supported (level 3)",
            ));
        }
        let tags = config.tags.join(",");
        let bootstrap = config.bootstrap.map(|c| c.hook);
        let core = Rc::new_cyclic(|me| SessionCore {
            me: me.clone(),
            state: RefCell::new(ConnectionState::new()),
            sender: RefCell::new(Some(sender)),
            ours: RefCell::new(HashMap::new()),
            embargoes: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            bootstrap,
            aborted: RefCell::new(None),
            tags,
        });
        Ok(Session { core })
    }

    /// Asks the peer for its bootstrap capability. The returned capability
    /// is usable immediately; calls pipeline until the answer arrives.
    pub fn bootstrap(&self) -> Client {
        if let Some(e) = self.core.abort_reason() {
            return Client::new(crate::broken::new_cap(e));
        }
        let (sref, resolver) = StructRef::new_pair();
        let question_id = self.core.state.borrow_mut().init_question(resolver);
        self.core.attach_question(&sref, question_id);
        debug!(tags = %self.core.tags, question_id, "requesting bootstrap");
        self.core.send(Frame::Bootstrap { question_id });
        let root = sref.cap(&[]);
        self.core.flush_deferred();
        root
    }

    /// Dispatches one inbound frame. A protocol error tears the session
    /// down and is returned to the caller.
    pub fn handle_frame(&self, frame: Frame) -> crate::Result<()> {
        if let Some(e) = self.core.abort_reason() {
            return Err(e);
        }
        trace!(tags = %self.core.tags, kind = frame.kind(), "handling frame");
        let result = match frame {
            Frame::Bootstrap { question_id } => self.core.handle_bootstrap(question_id),
            Frame::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params,
            } => self
                .core
                .handle_call(question_id, target, interface_id, method_id, params),
            Frame::Return { answer_id, which } => self.core.handle_return(answer_id, which),
            Frame::Finish {
                question_id,
                release_result_caps,
            } => self.core.handle_finish(question_id, release_result_caps),
            Frame::Release {
                id,
                reference_count,
            } => self.core.handle_release(id, reference_count),
            Frame::Disembargo { target, context } => {
                self.core.handle_disembargo(target, context)
            }
        };
        if let Err(e) = &result {
            if e.kind == crate::ErrorKind::Protocol {
                self.core.abort(e.clone());
            }
        }
        self.core.flush_deferred();
        result
    }

    /// Tears the session down: outstanding questions resolve with an
    /// exception, answers are abandoned, imports go dead, the sink is
    /// dropped. Also the right response to transport end-of-stream.
    pub fn abort(&self, reason: crate::Error) {
        self.core.abort(reason);
    }

    pub fn counts(&self) -> TableCounts {
        let state = self.core.state.borrow();
        TableCounts {
            questions: state.questions.len(),
            answers: state.answers.len(),
            exports: state.exports.len(),
            imports: state.imports.len(),
            embargoes: state.embargoes.len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.counts()
            == TableCounts {
                questions: 0,
                answers: 0,
                exports: 0,
                imports: 0,
                embargoes: 0,
            }
    }
}

impl SessionCore {
    fn abort_reason(&self) -> Option<crate::Error> {
        self.aborted.borrow().clone()
    }

    fn send(&self, frame: Frame) {
        if let Some(sender) = &*self.sender.borrow() {
            trace!(tags = %self.tags, kind = frame.kind(), "queueing frame");
            sender.queue_send(frame);
        }
    }

    /// Installs the wire half of a question promise: the pipeline hook that
    /// sends pipelined calls, and the drop guard that emits `Finish`.
    fn attach_question(&self, sref: &StructRef, question_id: QuestionId) {
        let question_ref = Rc::new(QuestionRef {
            core: self.me.clone(),
            question_id,
        });
        sref.set_remote(Rc::new(QuestionPipeline {
            core: self.me.clone(),
            question_id,
            _question_ref: question_ref,
        }));
    }

    /// Starts an outbound call and returns the read end of its promise.
    fn send_call(
        &self,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> StructRef {
        if let Some(e) = self.abort_reason() {
            return StructRef::error(e);
        }
        let (sref, resolver) = StructRef::new_pair();
        let frame = {
            let mut state = self.state.borrow_mut();
            let Payload { body, cap_table } = params;
            let mut descs = Vec::with_capacity(cap_table.len());
            for cap in cap_table {
                descs.push(self.to_cap_desc(&mut state, cap));
            }
            if let MessageTarget::PromisedAnswer {
                question_id,
                transform,
            } = &target
            {
                state.record_pipelined_send(*question_id, transform);
            }
            let question_id = state.init_question(resolver);
            self.attach_question(&sref, question_id);
            Frame::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params: WirePayload {
                    body,
                    cap_table: descs,
                },
            }
        };
        self.send(frame);
        self.flush_deferred();
        sref
    }

    /// Lowers one capability to a wire descriptor. Capabilities that came
    /// from the peer go back by reference; everything else is exported.
    fn to_cap_desc(&self, state: &mut ConnectionState, cap: Box<dyn ClientHook>) -> CapDescriptor {
        let short = capability::shortest(&*cap);
        drop(cap);
        if short.is_null() {
            return CapDescriptor::None;
        }
        {
            let ours = self.ours.borrow();
            match ours.get(&short.get_ptr()) {
                Some(WireRef::Import(id)) => return CapDescriptor::ReceiverHosted(*id),
                Some(WireRef::Answer(question_id, transform)) => {
                    // Usable only while the question can still be pipelined.
                    let live = state
                        .questions
                        .find(*question_id)
                        .map_or(false, |q| !q.finish_sent);
                    if live {
                        return CapDescriptor::ReceiverAnswer {
                            question_id: *question_id,
                            transform: transform.clone(),
                        };
                    }
                }
                None => {}
            }
        }
        let is_promise = short.is_promise();
        let id = state.export(short);
        if is_promise {
            CapDescriptor::SenderPromise(id)
        } else {
            CapDescriptor::SenderHosted(id)
        }
    }

    /// Materializes a peer-hosted capability, reusing the existing proxy for
    /// its import id so round-tripped capabilities share identity.
    fn import_cap(&self, id: ImportId, is_promise: bool) -> Box<dyn ClientHook> {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.imports.find(id) {
            if let Some(inner) = entry.proxy.upgrade() {
                inner.remote_refs.set(inner.remote_refs.get() + 1);
                return Box::new(ImportClient { inner });
            }
            // The proxy died but its deferred release has not run yet.
            let _ = state.imports.release(id);
        }
        let inner = Rc::new(ImportInner {
            core: self.me.clone(),
            id,
            remote_refs: Cell::new(1),
            is_promise,
        });
        let ptr = Rc::as_ptr(&inner) as usize;
        let _ = state.imports.set(
            id,
            ImportEntry {
                proxy: Rc::downgrade(&inner),
                ptr,
            },
        );
        drop(state);
        self.ours.borrow_mut().insert(ptr, WireRef::Import(id));
        Box::new(ImportClient { inner })
    }

    fn from_recv_cap(&self, recv: RecvCap) -> Box<dyn ClientHook> {
        match recv {
            RecvCap::None => crate::broken::null(),
            RecvCap::Local { cap, .. } => cap,
            RecvCap::Imported { id, is_promise } => self.import_cap(id, is_promise),
        }
    }

    /// Registers a fresh answer and arranges for its return frame to go out
    /// when the answer promise resolves.
    fn start_answer(&self, answer_id: QuestionId) -> crate::Result<(StructRef, StructResolver)> {
        let (answer_ref, resolver) = StructRef::new_pair();
        self.state
            .borrow_mut()
            .init_answer(answer_id, answer_ref.clone(), resolver.clone())?;
        let weak = self.me.clone();
        answer_ref.when_resolved(move |response| {
            if let Some(core) = weak.upgrade() {
                core.answer_resolved(answer_id, response.clone());
            }
        });
        Ok((answer_ref, resolver))
    }

    fn handle_bootstrap(&self, answer_id: QuestionId) -> crate::Result<()> {
        let (_answer_ref, resolver) = self.start_answer(answer_id)?;
        let response = match &self.bootstrap {
            Some(hook) => Ok(Payload::capability(hook.add_ref())),
            None => Err(crate::Error::exception(
                "no bootstrap capability is configured",
            )),
        };
        resolver.resolve(response);
        Ok(())
    }

    fn handle_call(
        &self,
        answer_id: QuestionId,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    ) -> crate::Result<()> {
        let (target_cap, recvs) = {
            let mut state = self.state.borrow_mut();
            let target_cap = state.call_target(&target)?;
            let mut recvs = Vec::with_capacity(params.cap_table.len());
            for desc in &params.cap_table {
                recvs.push(state.recv_cap(desc, false)?);
            }
            (target_cap, recvs)
        };
        let mut caps = Vec::with_capacity(recvs.len());
        for recv in recvs {
            caps.push(self.from_recv_cap(recv));
        }
        let (_answer_ref, resolver) = self.start_answer(answer_id)?;
        let result = target_cap.call(interface_id, method_id, Payload::new(params.body, caps));
        if let Err(e) = resolver.connect(&result) {
            resolver.resolve(Err(e));
        }
        Ok(())
    }

    /// Sends the return frame for a resolved answer and retires the answer
    /// if its finish already arrived.
    fn answer_resolved(&self, answer_id: QuestionId, response: crate::Result<Payload>) {
        if self.abort_reason().is_some() {
            return;
        }
        let frame = {
            let mut state = self.state.borrow_mut();
            if state.answers.find(answer_id).is_none() || state.begin_return(answer_id).is_err() {
                return;
            }
            let which = match &response {
                Ok(payload) => {
                    let mut descs = Vec::with_capacity(payload.cap_table.len());
                    let mut exported = Vec::new();
                    for cap in payload.cap_table.clone() {
                        let desc = self.to_cap_desc(&mut state, cap);
                        match &desc {
                            CapDescriptor::SenderHosted(id)
                            | CapDescriptor::SenderPromise(id) => exported.push(*id),
                            _ => {}
                        }
                        descs.push(desc);
                    }
                    state.note_return_exports(answer_id, exported);
                    Return::Results(WirePayload {
                        body: payload.body.clone(),
                        cap_table: descs,
                    })
                }
                Err(e) if e.kind == crate::ErrorKind::Cancelled => Return::Canceled,
                Err(e) => Return::Exception(e.description.clone()),
            };
            Frame::Return { answer_id, which }
        };
        self.send(frame);
        let retired = self.state.borrow_mut().answer_done(answer_id);
        drop(retired);
    }

    fn handle_return(&self, question_id: QuestionId, which: Return) -> crate::Result<()> {
        let Some((resolver, pipelined)) = self.state.borrow_mut().take_return(question_id)? else {
            // We cancelled this question; the return is dropped unread.
            return Ok(());
        };
        match which {
            Return::Exception(text) => resolver.resolve(Err(crate::Error::exception(text))),
            Return::Canceled => resolver.resolve(Err(crate::Error::cancelled())),
            Return::Results(WirePayload { body, cap_table }) => {
                // Slots reached by a pipelined send, keyed to the first path
                // that reached them. Only those need the loopback embargo.
                let mut promoted: HashMap<u32, PipelinePath> = HashMap::new();
                for path in &pipelined {
                    if let Ok(Some(slot)) = body.cap_slot(path) {
                        promoted.entry(slot).or_insert_with(|| path.clone());
                    }
                }
                let recvs = {
                    let mut state = self.state.borrow_mut();
                    let mut recvs = Vec::with_capacity(cap_table.len());
                    for desc in &cap_table {
                        recvs.push(state.recv_cap(desc, true)?);
                    }
                    recvs
                };
                let mut caps = Vec::with_capacity(recvs.len());
                for (slot, recv) in recvs.into_iter().enumerate() {
                    let cap = match recv {
                        RecvCap::Local { cap, loopback: true } => {
                            match promoted.get(&(slot as u32)) {
                                Some(path) if self.needs_embargo(&*cap) => {
                                    self.embargo(question_id, path.clone(), cap)
                                }
                                _ => cap,
                            }
                        }
                        other => self.from_recv_cap(other),
                    };
                    caps.push(cap);
                }
                resolver.resolve(Ok(Payload::new(body, caps)));
            }
        }
        Ok(())
    }

    fn needs_embargo(&self, cap: &dyn ClientHook) -> bool {
        let short = capability::shortest(cap);
        if short.is_null() {
            return false;
        }
        // A cap that is really the peer's (an import proxy, or a promise
        // that resolved into one) keeps its calls on the wire in order; only
        // a genuinely local target can be overtaken.
        !self.ours.borrow().contains_key(&short.get_ptr())
    }

    /// Wraps a loopback capability in an embargo: calls queue behind the
    /// disembargo round trip so pipelined calls still in flight land first.
    fn embargo(
        &self,
        question_id: QuestionId,
        path: PipelinePath,
        cap: Box<dyn ClientHook>,
    ) -> Box<dyn ClientHook> {
        let ptr = cap.get_ptr();
        let embargo_id = self.state.borrow_mut().alloc_embargo(ptr);
        let client = queued::Client::new_detached();
        self.embargoes.borrow_mut().insert(
            (ptr, embargo_id),
            EmbargoHold {
                client: client.clone(),
                underlying: cap,
            },
        );
        debug!(tags = %self.tags, embargo_id, "embargoing loopback capability");
        self.send(Frame::Disembargo {
            target: MessageTarget::PromisedAnswer {
                question_id,
                transform: path,
            },
            context: Disembargo::SenderLoopback(embargo_id),
        });
        Box::new(client)
    }

    fn handle_finish(&self, answer_id: QuestionId, release_result_caps: bool) -> crate::Result<()> {
        let action = self
            .state
            .borrow_mut()
            .handle_finish(answer_id, release_result_caps)?;
        match action {
            FinishAction::Cancel(resolver) => {
                // The call machinery sees the cancelled answer and emits the
                // canceled return.
                resolver.resolve(Err(crate::Error::cancelled()));
            }
            FinishAction::Completed { answer, released } => {
                drop(answer);
                drop(released);
            }
        }
        Ok(())
    }

    fn handle_release(&self, id: u32, reference_count: u32) -> crate::Result<()> {
        let released = self
            .state
            .borrow_mut()
            .release_export(id, reference_count)?;
        drop(released);
        Ok(())
    }

    fn handle_disembargo(
        &self,
        target: MessageTarget,
        context: Disembargo,
    ) -> crate::Result<()> {
        match context {
            Disembargo::SenderLoopback(embargo_id) => {
                let cap = self.state.borrow().call_target(&target)?;
                let short = capability::shortest(&*cap);
                if short.is_promise() {
                    return Err(crate::Error::protocol(
                        "disembargo request for an unresolved answer",
                    ));
                }
                let import_id = match self.ours.borrow().get(&short.get_ptr()) {
                    Some(WireRef::Import(id)) => *id,
                    _ => {
                        return Err(crate::Error::protocol(
                            "disembargo target is not a capability imported from the peer",
                        ));
                    }
                };
                self.send(Frame::Disembargo {
                    target: MessageTarget::ImportedCap(import_id),
                    context: Disembargo::ReceiverLoopback(embargo_id),
                });
                Ok(())
            }
            Disembargo::ReceiverLoopback(embargo_id) => {
                let ptr = self.state.borrow_mut().take_embargo(embargo_id)?;
                let hold = self
                    .embargoes
                    .borrow_mut()
                    .remove(&(ptr, embargo_id))
                    .ok_or_else(|| {
                        crate::Error::protocol(format!("unknown embargo {embargo_id}"))
                    })?;
                debug!(tags = %self.tags, embargo_id, "lifting embargo");
                hold.client.resolve_to(hold.underlying);
                Ok(())
            }
        }
    }

    fn abort(&self, reason: crate::Error) {
        if self.abort_reason().is_some() {
            return;
        }
        warn!(tags = %self.tags, error = %reason, "aborting session");
        *self.aborted.borrow_mut() = Some(reason.clone());
        let teardown = self.state.borrow_mut().teardown();
        let holds: Vec<EmbargoHold> = self
            .embargoes
            .borrow_mut()
            .drain()
            .map(|(_, hold)| hold)
            .collect();
        self.ours.borrow_mut().clear();
        let sender = self.sender.borrow_mut().take();
        drop(sender);

        let failure = crate::Error::exception(format!("session aborted: {}", reason.description));
        for resolver in teardown.resolvers {
            resolver.resolve(Err(failure.clone()));
        }
        for hold in holds {
            hold.client
                .resolve_to(crate::broken::new_cap(crate::Error::disconnected(
                    "session aborted while an embargo was pending",
                )));
            drop(hold.underlying);
        }
        drop(teardown.answers);
        drop(teardown.caps);
        self.flush_deferred();
    }

    fn import_dropped(&self, id: ImportId, ptr: usize, count: u32) {
        self.deferred
            .borrow_mut()
            .push_back(Deferred::ImportDropped { id, ptr, count });
        self.flush_deferred();
    }

    fn question_dropped(&self, question_id: QuestionId) {
        self.deferred
            .borrow_mut()
            .push_back(Deferred::QuestionDropped(question_id));
        self.flush_deferred();
    }

    /// Runs deferred drop effects, unless we are nested inside a dispatch
    /// that still holds the state — the outermost entry point will get them.
    fn flush_deferred(&self) {
        loop {
            let Some(next) = self.deferred.borrow_mut().pop_front() else {
                return;
            };
            let mut state = match self.state.try_borrow_mut() {
                Ok(state) => state,
                Err(_) => {
                    self.deferred.borrow_mut().push_front(next);
                    return;
                }
            };
            let mut ours = match self.ours.try_borrow_mut() {
                Ok(ours) => ours,
                Err(_) => {
                    self.deferred.borrow_mut().push_front(next);
                    return;
                }
            };
            match next {
                Deferred::ImportDropped { id, ptr, count } => {
                    // A newer proxy may have taken over this import id; its
                    // references are counted separately, so the peer is owed
                    // this release either way.
                    let current = state.imports.find(id).map_or(false, |e| e.ptr == ptr);
                    if current {
                        let _ = state.imports.release(id);
                    }
                    ours.remove(&ptr);
                    drop(ours);
                    drop(state);
                    if self.abort_reason().is_none() {
                        self.send(Frame::Release {
                            id,
                            reference_count: count,
                        });
                    }
                }
                Deferred::QuestionDropped(question_id) => {
                    let frame = state.finish_question(question_id);
                    drop(ours);
                    drop(state);
                    if let Some(frame) = frame {
                        if self.abort_reason().is_none() {
                            self.send(frame);
                        }
                    }
                }
            }
        }
    }
}

/// Shared state of an import proxy. The destructor emits `Release` with the
/// accumulated count.
pub(crate) struct ImportInner {
    core: Weak<SessionCore>,
    id: ImportId,
    /// How many references the peer has granted us for this id.
    remote_refs: Cell<u32>,
    is_promise: bool,
}

impl Drop for ImportInner {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let ptr = self as *const Self as usize;
            core.import_dropped(self.id, ptr, self.remote_refs.get());
        }
    }
}

/// A proxy for a capability hosted by the peer.
struct ImportClient {
    inner: Rc<ImportInner>,
}

impl ClientHook for ImportClient {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(Self {
            inner: self.inner.clone(),
        })
    }

    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> StructRef {
        match self.inner.core.upgrade() {
            Some(core) => core.send_call(
                MessageTarget::ImportedCap(self.inner.id),
                interface_id,
                method_id,
                params,
            ),
            None => StructRef::error(crate::Error::disconnected(
                "session for this capability is gone",
            )),
        }
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
        self.inner.is_promise
    }

    fn is_null(&self) -> bool {
        false
    }

    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

/// Drop guard for our half of a question: the last holder emits `Finish`.
struct QuestionRef {
    core: Weak<SessionCore>,
    question_id: QuestionId,
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.question_dropped(self.question_id);
        }
    }
}

/// The wire half of a question promise: pipelined calls and round-trip
/// bookkeeping for path capabilities.
struct QuestionPipeline {
    core: Weak<SessionCore>,
    question_id: QuestionId,
    _question_ref: Rc<QuestionRef>,
}

impl RemoteHook for QuestionPipeline {
    fn call(
        &self,
        transform: &[u16],
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> StructRef {
        match self.core.upgrade() {
            Some(core) => core.send_call(
                MessageTarget::PromisedAnswer {
                    question_id: self.question_id,
                    transform: PipelinePath::from_slice(transform),
                },
                interface_id,
                method_id,
                params,
            ),
            None => StructRef::error(crate::Error::disconnected(
                "session for this capability is gone",
            )),
        }
    }

    fn minted(&self, transform: &[u16], ptr: usize) {
        if let Some(core) = self.core.upgrade() {
            core.ours.borrow_mut().insert(
                ptr,
                WireRef::Answer(self.question_id, PipelinePath::from_slice(transform)),
            );
        }
    }

    fn resolved(&self, ptr: usize) {
        if let Some(core) = self.core.upgrade() {
            core.ours.borrow_mut().remove(&ptr);
        }
    }
}
