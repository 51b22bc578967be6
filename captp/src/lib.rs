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

//! The connection-level state machine of the Cap'n Proto RPC protocol,
//! Level 1: questions, answers, exports, imports, promise pipelining,
//! embargoes, and distributed reference counting.
//!
//! A [`session::Session`] sits between a frame transport supplied by the
//! host (see [`session::FrameSender`] and [`twoparty`]) and user code
//! holding [`capability::Client`] handles. Payload bodies are opaque to this
//! crate; the host's schema codec implements [`payload::Content`] to let the
//! session follow pipeline paths into them.
//!
//! Everything here is single-threaded per connection. Resolution callbacks
//! fire synchronously from whichever frame or user call triggered them.

use std::fmt;

pub mod broken;
pub mod capability;
pub mod local;
pub mod message;
pub mod payload;
pub mod queued;
pub mod session;
pub mod table;
pub mod twoparty;

pub(crate) mod rpc;
pub(crate) mod sender_queue;

pub use capability::{Client, Promise};
pub use payload::Payload;
pub use queued::{Response, StructRef, StructResolver};
pub use session::{FrameSender, Session};

/// The categories of failure surfaced by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A failure reported by the peer or raised by a local method body.
    /// Resolves only the call it belongs to.
    Exception,

    /// The call was terminated by cancellation before it produced a result.
    Cancelled,

    /// The peer violated the protocol. Fatal to the whole session.
    Protocol,

    /// The session has been torn down or the transport is gone.
    Disconnected,
}

/// An error, with a category and a human-readable description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
}

impl Error {
    pub fn exception<T: Into<String>>(description: T) -> Self {
        Self {
            kind: ErrorKind::Exception,
            description: description.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            description: "call was cancelled".into(),
        }
    }

    pub fn protocol<T: Into<String>>(description: T) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            description: description.into(),
        }
    }

    pub fn disconnected<T: Into<String>>(description: T) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            description: description.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Exception => "exception",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Disconnected => "disconnected",
        };
        write!(f, "{}: {}", kind, self.description)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Session construction options.
///
/// `tags` is a diagnostic label set carried on every tracing event the
/// session emits. Third-party tail calls are a Level 3 feature; asking for
/// them is rejected at construction.
pub struct Config {
    pub bootstrap: Option<Client>,
    pub tags: Vec<String>,
    pub allow_third_party_tail_call: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: None,
            tags: Vec::new(),
            allow_third_party_tail_call: false,
        }
    }
}

/// Wraps a server implementation in a capability handle.
pub fn new_client<S>(server: S) -> Client
where
    S: local::Server + 'static,
{
    Client::new(Box::new(local::Client::new(server)))
}

pub(crate) fn canceled_to_error(_e: tokio::sync::oneshot::error::RecvError) -> Error {
    Error::cancelled()
}
