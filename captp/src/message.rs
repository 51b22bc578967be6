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

//! The semantic frame model: everything a session sends or receives, one
//! step before serialization. Field and variant names follow `rpc.capnp`.

use std::fmt;

use smallvec::SmallVec;

use crate::payload::Body;

pub type QuestionId = u32;
pub type AnswerId = QuestionId;
pub type ExportId = u32;
pub type ImportId = ExportId;
pub type EmbargoId = u32;

/// A sequence of 16-bit field indices into a result struct.
pub type PipelinePath = SmallVec<[u16; 4]>;

/// The object a call or disembargo is aimed at, in the receiver's id space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageTarget {
    /// A capability previously exported by the receiver.
    ImportedCap(ExportId),
    /// A capability expected to appear in the results of an outstanding
    /// answer on the receiver's side.
    PromisedAnswer {
        question_id: QuestionId,
        transform: PipelinePath,
    },
}

/// How one capability in a payload's cap table is addressed on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted(ExportId),
    SenderPromise(ExportId),
    ReceiverHosted(ImportId),
    ReceiverAnswer {
        question_id: QuestionId,
        transform: PipelinePath,
    },
    /// Level 3. Recognized so it can be rejected, never accepted.
    ThirdPartyHosted,
}

/// A payload whose capabilities have been lowered to wire descriptors.
pub struct WirePayload {
    pub body: Body,
    pub cap_table: Vec<CapDescriptor>,
}

impl fmt::Debug for WirePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirePayload")
            .field("cap_table", &self.cap_table)
            .finish()
    }
}

#[derive(Debug)]
pub enum Return {
    Results(WirePayload),
    Exception(String),
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disembargo {
    /// Request: the sender's promise resolved to a capability hosted by the
    /// receiver, and the sender needs the pipeline drained.
    SenderLoopback(EmbargoId),
    /// Reply: echoed back so the requester can lift the embargo.
    ReceiverLoopback(EmbargoId),
}

/// One frame of the Level 1 protocol.
#[derive(Debug)]
pub enum Frame {
    Bootstrap {
        question_id: QuestionId,
    },
    Call {
        question_id: QuestionId,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    },
    Return {
        answer_id: AnswerId,
        which: Return,
    },
    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },
    Release {
        id: ExportId,
        reference_count: u32,
    },
    Disembargo {
        target: MessageTarget,
        context: Disembargo,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "bootstrap",
            Self::Call { .. } => "call",
            Self::Return { .. } => "return",
            Self::Finish { .. } => "finish",
            Self::Release { .. } => "release",
            Self::Disembargo { .. } => "disembargo",
        }
    }
}
