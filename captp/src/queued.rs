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

//! The promise graph.
//!
//! A struct promise ([`StructRef`] / [`StructResolver`]) stands for the
//! results of a call that has not returned yet. Capabilities pipelined out
//! of it ([`StructRef::cap`]) are [`Client`]s: promise capabilities that
//! either queue calls locally until the results arrive, or — when the
//! promise is the answer to a remote question — forward them to the wire as
//! pipelined calls.
//!
//! Resolution is synchronous: whoever resolves a promise runs its waiters
//! and flushes its queues before the resolving call returns.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use futures_util::TryFutureExt;
use tokio::sync::oneshot;

use crate::capability::{self, ClientHook, Promise, ResolveWaiter};
use crate::message::PipelinePath;
use crate::payload::Payload;
use crate::sender_queue::SenderQueue;

/// The resolution of a struct promise.
pub type Response = crate::Result<Payload>;

type Waiter = Box<dyn FnOnce(&Response)>;

/// Session-side hooks for a promise that is the answer to a remote
/// question: pipelined sends and round-trip bookkeeping.
pub(crate) trait RemoteHook {
    fn call(
        &self,
        transform: &[u16],
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> StructRef;

    /// A path capability was minted under `transform` with identity `ptr`.
    fn minted(&self, transform: &[u16], ptr: usize);

    /// The path capability with identity `ptr` has resolved.
    fn resolved(&self, ptr: usize);
}

enum State {
    Unresolved { waiters: SenderQueue<Waiter> },
    Resolved(Response),
}

struct StructInner {
    state: State,
    /// Path capabilities interned while unresolved, resolved in place when
    /// the response arrives.
    caps: BTreeMap<PipelinePath, Client>,
    remote: Option<Rc<dyn RemoteHook>>,
    /// The promise this one is connected to, if any. Held strongly so the
    /// source keeps producing; also the back-pointer chain that `connect`
    /// walks to refuse cycles.
    waiting_on: Option<StructRef>,
}

/// The read end of a struct promise. Dropping the last read end relinquishes
/// the result (for a remote question, that sends `Finish`).
pub struct StructRef {
    inner: Rc<RefCell<StructInner>>,
}

impl Clone for StructRef {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The write end of a struct promise. Holds no strong reference: resolving
/// a promise nobody can read any more is a no-op.
pub struct StructResolver {
    inner: Weak<RefCell<StructInner>>,
}

impl Clone for StructResolver {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn new_inner() -> (StructRef, StructResolver) {
    let inner = Rc::new(RefCell::new(StructInner {
        state: State::Unresolved {
            waiters: SenderQueue::new(),
        },
        caps: BTreeMap::new(),
        remote: None,
        waiting_on: None,
    }));
    let resolver = StructResolver {
        inner: Rc::downgrade(&inner),
    };
    (StructRef { inner }, resolver)
}

impl StructRef {
    /// A fresh local promise.
    pub fn new_pair() -> (StructRef, StructResolver) {
        new_inner()
    }

    /// An already-resolved result.
    pub fn immediate(response: Response) -> StructRef {
        let (sref, _resolver) = new_inner();
        sref.inner.borrow_mut().state = State::Resolved(response);
        sref
    }

    pub fn ok(payload: Payload) -> StructRef {
        Self::immediate(Ok(payload))
    }

    pub fn error(error: crate::Error) -> StructRef {
        Self::immediate(Err(error))
    }

    /// The current resolution state, if any.
    pub fn response(&self) -> Option<Response> {
        match &self.inner.borrow().state {
            State::Unresolved { .. } => None,
            State::Resolved(r) => Some(r.clone()),
        }
    }

    /// Runs `f` when the promise resolves — immediately if it already has.
    pub fn when_resolved<F>(&self, f: F)
    where
        F: FnOnce(&Response) + 'static,
    {
        let resolved = {
            let mut inner = self.inner.borrow_mut();
            match &mut inner.state {
                State::Unresolved { waiters } => {
                    waiters.push(Box::new(f));
                    return;
                }
                State::Resolved(r) => r.clone(),
            }
        };
        f(&resolved);
    }

    /// The capability at `transform` within the results. While unresolved,
    /// equal paths intern to the same promise capability.
    pub fn cap(&self, transform: &[u16]) -> capability::Client {
        let (client, remote) = {
            let mut inner = self.inner.borrow_mut();
            match &inner.state {
                State::Resolved(Ok(payload)) => {
                    return capability::Client::new(payload.cap_at(transform));
                }
                State::Resolved(Err(e)) => {
                    return capability::Client::new(crate::broken::new_cap(e.clone()));
                }
                State::Unresolved { .. } => {}
            }
            let path = PipelinePath::from_slice(transform);
            if let Some(existing) = inner.caps.get(&path) {
                return capability::Client::new(Box::new(existing.clone()));
            }
            let remote = inner.remote.clone();
            let client = Client::new_path_bound(self.clone(), path.clone(), remote.clone());
            inner.caps.insert(path, client.clone());
            (client, remote)
        };
        if let Some(remote) = remote {
            remote.minted(transform, client.ptr());
        }
        capability::Client::new(Box::new(client))
    }

    /// Bridges the resolution to a future.
    pub fn promise(&self) -> Promise<Payload, crate::Error> {
        match self.response() {
            Some(Ok(payload)) => Promise::ok(payload),
            Some(Err(e)) => Promise::err(e),
            None => {
                let (tx, rx) = oneshot::channel::<Response>();
                self.when_resolved(move |r| {
                    let _ = tx.send(r.clone());
                });
                let rx = rx.map_err(crate::canceled_to_error);
                Promise::from_future(async move { rx.await? })
            }
        }
    }

    /// Relinquishes the result.
    pub fn finish(self) {
        drop(self);
    }

    /// Installs the wire half of a question promise. Only meaningful right
    /// after construction, before any path capability has been minted.
    pub(crate) fn set_remote(&self, remote: Rc<dyn RemoteHook>) {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(inner.caps.is_empty());
        inner.remote = Some(remote);
    }

    fn ptr_eq(&self, other: &StructRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl StructResolver {
    /// Resolves the promise, synchronously running waiters and resolving
    /// interned path capabilities. Resolving twice is a bug, except that a
    /// cancelled promise absorbs whatever late resolution still arrives.
    pub fn resolve(&self, response: Response) {
        let Some(inner) = self.inner.upgrade() else {
            // Every read end is gone; nobody is listening.
            return;
        };
        let (waiters, caps, remote) = {
            let mut inner = inner.borrow_mut();
            match &mut inner.state {
                State::Resolved(Err(e)) if e.kind == crate::ErrorKind::Cancelled => return,
                State::Resolved(_) => panic!("struct promise resolved twice"),
                State::Unresolved { waiters } => {
                    let waiters = waiters.drain();
                    let caps = std::mem::take(&mut inner.caps);
                    let remote = inner.remote.take();
                    inner.state = State::Resolved(response.clone());
                    inner.waiting_on = None;
                    (waiters, caps, remote)
                }
            }
        };
        for (path, client) in caps {
            if let Some(remote) = &remote {
                remote.resolved(client.ptr());
            }
            let target = match &response {
                Ok(payload) => payload.cap_at(&path),
                Err(e) => crate::broken::new_cap(e.clone()),
            };
            client.resolve_to(target);
        }
        for waiter in waiters {
            waiter(&response);
        }
        // `remote` drops here, after the pipeline has been redirected; for a
        // question promise that is what allows Finish to go out.
        drop(remote);
    }

    /// Forwards another promise's resolution to this one. Refuses targets
    /// whose resolution already waits on this promise.
    pub fn connect(&self, other: &StructRef) -> crate::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        {
            let inner_ref = inner.borrow();
            if let State::Resolved(_) = inner_ref.state {
                return Err(crate::Error::exception(
                    "connect on an already-resolved promise",
                ));
            }
        }
        let myself = StructRef {
            inner: inner.clone(),
        };
        let mut cursor = other.clone();
        loop {
            if cursor.ptr_eq(&myself) {
                return Err(crate::Error::exception(
                    "connecting these promises would create a cycle",
                ));
            }
            let next = cursor.inner.borrow().waiting_on.clone();
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        inner.borrow_mut().waiting_on = Some(other.clone());
        let resolver = self.clone();
        other.when_resolved(move |response| resolver.resolve(response.clone()));
        Ok(())
    }

    pub(crate) fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

struct QueuedCall {
    resolver: StructResolver,
    interface_id: u64,
    method_id: u16,
    params: Payload,
}

enum ClientState {
    Unresolved(SenderQueue<QueuedCall>),
    Resolved(Box<dyn ClientHook>),
}

struct ClientInner {
    state: ClientState,
    /// While unresolved and path-bound: the struct promise this capability
    /// was interned under, and the path within it.
    parent: Option<(StructRef, PipelinePath)>,
    remote: Option<Rc<dyn RemoteHook>>,
    /// Sub-path capabilities minted with no parent to intern them.
    children: Vec<(PipelinePath, Client)>,
    resolve_waiters: SenderQueue<ResolveWaiter>,
}

/// A promise capability: calls made before resolution are queued (or, for a
/// remote question, pipelined to the wire) and forwarded in order once the
/// target is known.
pub struct Client {
    inner: Rc<RefCell<ClientInner>>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Client {
    fn make(
        parent: Option<(StructRef, PipelinePath)>,
        remote: Option<Rc<dyn RemoteHook>>,
    ) -> Client {
        Client {
            inner: Rc::new(RefCell::new(ClientInner {
                state: ClientState::Unresolved(SenderQueue::new()),
                parent,
                remote,
                children: Vec::new(),
                resolve_waiters: SenderQueue::new(),
            })),
        }
    }

    pub(crate) fn new_path_bound(
        parent: StructRef,
        path: PipelinePath,
        remote: Option<Rc<dyn RemoteHook>>,
    ) -> Client {
        Self::make(Some((parent, path)), remote)
    }

    /// A free-standing promise capability; the embargo mechanism uses these.
    pub(crate) fn new_detached() -> Client {
        Self::make(None, None)
    }

    pub(crate) fn ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    /// Resolves this capability to `target`, flushing queued calls in
    /// order. A chain leading back to this capability is broken off to a
    /// failed endpoint rather than looping.
    pub(crate) fn resolve_to(&self, target: Box<dyn ClientHook>) {
        let target = if capability::shortest(&*target).get_ptr() == self.ptr() {
            crate::broken::new_cap(crate::Error::exception(
                "capability promise resolved to itself",
            ))
        } else {
            target
        };
        let (queued, children, waiters, remote) = {
            let mut inner = self.inner.borrow_mut();
            match &mut inner.state {
                ClientState::Resolved(_) => panic!("capability promise resolved twice"),
                ClientState::Unresolved(queue) => {
                    let queued = queue.drain();
                    let children = std::mem::take(&mut inner.children);
                    let waiters = inner.resolve_waiters.drain();
                    let remote = inner.remote.take();
                    inner.parent = None;
                    inner.state = ClientState::Resolved(target.add_ref());
                    (queued, children, waiters, remote)
                }
            }
        };
        if let Some(remote) = remote {
            remote.resolved(self.ptr());
        }
        let forward_to = capability::shortest(&*target);
        for call in queued {
            if !call.resolver.is_live() {
                // The caller dropped the result before we could issue the
                // call; the call itself is abandoned with it.
                continue;
            }
            let result = forward_to.call(call.interface_id, call.method_id, call.params);
            let _ = call.resolver.connect(&result);
        }
        for (path, child) in children {
            child.resolve_to(target.get_pipelined_cap(&path));
        }
        for waiter in waiters {
            waiter(target.add_ref());
        }
    }
}

impl ClientHook for Client {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(self.clone())
    }

    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> StructRef {
        enum Route {
            Forward(Box<dyn ClientHook>),
            Pipeline(Rc<dyn RemoteHook>, PipelinePath),
            Queue,
        }
        let route = {
            let inner = self.inner.borrow();
            match &inner.state {
                ClientState::Resolved(c) => Route::Forward(c.add_ref()),
                ClientState::Unresolved(_) => match (&inner.remote, &inner.parent) {
                    (Some(remote), Some((_, path))) => {
                        Route::Pipeline(remote.clone(), path.clone())
                    }
                    _ => Route::Queue,
                },
            }
        };
        match route {
            Route::Forward(c) => c.call(interface_id, method_id, params),
            Route::Pipeline(remote, path) => remote.call(&path, interface_id, method_id, params),
            Route::Queue => {
                let (sref, resolver) = StructRef::new_pair();
                let mut inner = self.inner.borrow_mut();
                match &mut inner.state {
                    ClientState::Unresolved(queue) => queue.push(QueuedCall {
                        resolver,
                        interface_id,
                        method_id,
                        params,
                    }),
                    // Resolved in between the two borrows is impossible:
                    // resolution is synchronous and we are on the only thread.
                    ClientState::Resolved(_) => unreachable!(),
                }
                sref
            }
        }
    }

    fn get_pipelined_cap(&self, transform: &[u16]) -> Box<dyn ClientHook> {
        if transform.is_empty() {
            return self.add_ref();
        }
        let parent = {
            let mut inner = self.inner.borrow_mut();
            match &inner.state {
                ClientState::Resolved(c) => return c.get_pipelined_cap(transform),
                ClientState::Unresolved(_) => {}
            }
            match &inner.parent {
                Some((parent, base)) => {
                    let mut path = base.clone();
                    path.extend_from_slice(transform);
                    (parent.clone(), path)
                }
                None => {
                    let path = PipelinePath::from_slice(transform);
                    if let Some((_, existing)) =
                        inner.children.iter().find(|(p, _)| *p == path)
                    {
                        return Box::new(existing.clone());
                    }
                    let child = Client::new_detached();
                    inner.children.push((path, child.clone()));
                    return Box::new(child);
                }
            }
        };
        parent.0.cap(&parent.1).hook
    }

    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        match &self.inner.borrow().state {
            ClientState::Resolved(c) => Some(c.add_ref()),
            ClientState::Unresolved(_) => None,
        }
    }

    fn when_more_resolved(&self, waiter: ResolveWaiter) -> Option<ResolveWaiter> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            ClientState::Resolved(_) => Some(waiter),
            ClientState::Unresolved(_) => {
                inner.resolve_waiters.push(waiter);
                None
            }
        }
    }

    fn is_promise(&self) -> bool {
        matches!(self.inner.borrow().state, ClientState::Unresolved(_))
    }

    fn is_null(&self) -> bool {
        false
    }

    fn get_ptr(&self) -> usize {
        self.ptr()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{Client, StructRef};
    use crate::capability::ClientHook;
    use crate::local::Server;
    use crate::payload::Payload;

    struct Recorder {
        log: Rc<RefCell<Vec<u16>>>,
    }

    impl Server for Recorder {
        fn dispatch_call(
            self: Rc<Self>,
            _interface_id: u64,
            method_id: u16,
            _params: Payload,
        ) -> StructRef {
            self.log.borrow_mut().push(method_id);
            StructRef::ok(Payload::empty())
        }
    }

    #[test]
    fn queued_calls_flush_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let promise = Client::new_detached();
        let r1 = promise.call(0, 1, Payload::empty());
        let r2 = promise.call(0, 2, Payload::empty());
        assert!(r1.response().is_none());

        promise.resolve_to(crate::new_client(Recorder { log: log.clone() }).hook);
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert!(matches!(r1.response(), Some(Ok(_))));
        assert!(matches!(r2.response(), Some(Ok(_))));
    }

    #[test]
    fn calls_after_resolution_forward_directly() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let promise = Client::new_detached();
        promise.resolve_to(crate::new_client(Recorder { log: log.clone() }).hook);
        let r = promise.call(0, 7, Payload::empty());
        assert_eq!(*log.borrow(), vec![7]);
        assert!(matches!(r.response(), Some(Ok(_))));
    }

    #[test]
    fn dropped_results_abandon_their_queued_calls() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let promise = Client::new_detached();
        drop(promise.call(0, 1, Payload::empty()));
        let kept = promise.call(0, 2, Payload::empty());
        promise.resolve_to(crate::new_client(Recorder { log: log.clone() }).hook);
        assert_eq!(*log.borrow(), vec![2]);
        drop(kept);
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn double_resolution_is_a_bug() {
        let promise = Client::new_detached();
        promise.resolve_to(crate::broken::null());
        promise.resolve_to(crate::broken::null());
    }

    #[test]
    fn path_caps_intern_by_path() {
        let (sref, _resolver) = StructRef::new_pair();
        let a = sref.cap(&[1, 2]);
        let b = sref.cap(&[1, 2]);
        let c = sref.cap(&[1]);
        assert_eq!(a.hook.get_ptr(), b.hook.get_ptr());
        assert_ne!(a.hook.get_ptr(), c.hook.get_ptr());
    }

    #[test]
    fn connect_forwards_resolution() {
        let (a_ref, a_res) = StructRef::new_pair();
        let (b_ref, b_res) = StructRef::new_pair();
        a_res.connect(&b_ref).unwrap();
        assert!(a_ref.response().is_none());
        b_res.resolve(Ok(Payload::empty()));
        assert!(matches!(a_ref.response(), Some(Ok(_))));
    }

    #[test]
    fn connect_refuses_cycles() {
        let (a_ref, a_res) = StructRef::new_pair();
        let (b_ref, b_res) = StructRef::new_pair();
        a_res.connect(&b_ref).unwrap();
        assert!(b_res.connect(&a_ref).is_err());
    }

    #[test]
    fn cancelled_promises_absorb_late_resolutions() {
        let (sref, resolver) = StructRef::new_pair();
        resolver.resolve(Err(crate::Error::cancelled()));
        resolver.resolve(Ok(Payload::empty()));
        match sref.response() {
            Some(Err(e)) => assert_eq!(e.kind, crate::ErrorKind::Cancelled),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
