//! Commit surface of the durable store.
//!
//! Only the completion contract matters to the engine: a commit either
//! finishes before returning ([`CallStatus::Completed`], the callback is
//! dropped unused) or finishes later and calls the callback exactly once
//! ([`CallStatus::AsyncCompletion`]).

use std::fmt;
use std::sync::Arc;

use crate::fake_async::{Callback, FakeAsyncDispatcher};
use crate::{CallStatus, Result};

pub type CommitCallback = Callback;

pub trait Store: Send + Sync + fmt::Debug {
    fn commit(&self, on_commit: CommitCallback) -> Result<CallStatus>;
}

/// Commits complete inline.
#[derive(Debug, Default)]
pub struct SyncStore;

impl Store for SyncStore {
    #[inline]
    fn commit(&self, _on_commit: CommitCallback) -> Result<CallStatus> {
        Ok(CallStatus::Completed)
    }
}

/// Commits inline, then reports completion from a dispatcher thread.
#[derive(Debug)]
pub struct FakeAsyncStore {
    dispatcher: Arc<FakeAsyncDispatcher>,
}

impl FakeAsyncStore {
    #[inline]
    pub fn new(dispatcher: Arc<FakeAsyncDispatcher>) -> Self {
        Self { dispatcher }
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<FakeAsyncDispatcher> {
        &self.dispatcher
    }
}

impl Store for FakeAsyncStore {
    fn commit(&self, on_commit: CommitCallback) -> Result<CallStatus> {
        match self.dispatcher.enqueue(Ok(()), on_commit) {
            Ok(()) => Ok(CallStatus::AsyncCompletion),
            // dispatcher gone, the commit itself is already done
            Err(_on_commit) => Ok(CallStatus::Completed),
        }
    }
}
