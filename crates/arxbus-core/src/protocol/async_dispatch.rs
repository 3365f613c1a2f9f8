//! Async front-end
//!
//! Bus transactions block for up to their deadline, so from async code they
//! run on tokio's blocking pool. Cancelling the token returns immediately;
//! the blocking side notices it at its next poll, discards any partial
//! response and releases the bus.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::commands::Command;
use super::dispatch::{Dispatcher, Reply};
use super::frame::BoardAddress;
use super::{DispatchError, TransportError};

/// A [`Dispatcher`] usable from async tasks
#[derive(Clone)]
pub struct AsyncDispatcher {
    dispatcher: Dispatcher,
}

impl AsyncDispatcher {
    /// Wrap a blocking dispatcher
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// The wrapped blocking dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch one command without a cancellation token
    pub async fn dispatch(
        &self,
        address: BoardAddress,
        command: Command,
    ) -> Result<Reply, DispatchError> {
        self.dispatch_with_cancel(address, command, CancellationToken::new())
            .await
    }

    /// Dispatch one command, giving up as soon as `cancel` fires
    pub async fn dispatch_with_cancel(
        &self,
        address: BoardAddress,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<Reply, DispatchError> {
        let dispatcher = self.dispatcher.clone();
        let token = cancel.child_token();
        let worker_token = token.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            dispatcher.dispatch_with_cancel(address, &command, &worker_token)
        });

        tokio::select! {
            joined = &mut handle => joined.map_err(|e| {
                DispatchError::Transport(TransportError::Link(std::io::Error::other(e)))
            })?,
            _ = cancel.cancelled() => {
                debug!("dispatch to {} cancelled", address);
                token.cancel();
                Err(DispatchError::Cancelled)
            }
        }
    }

    /// Dispatch to several boards in turn, stopping at the first cancellation
    ///
    /// The bus carries one command at a time, so this is sequential; each
    /// board's result is returned in order.
    pub async fn dispatch_each(
        &self,
        addresses: &[BoardAddress],
        command: Command,
        cancel: CancellationToken,
    ) -> Vec<(BoardAddress, Result<Reply, DispatchError>)> {
        let mut results = Vec::with_capacity(addresses.len());
        for &address in addresses {
            let result = self
                .dispatch_with_cancel(address, command.clone(), cancel.clone())
                .await;
            let cancelled = matches!(result, Err(DispatchError::Cancelled));
            results.push((address, result));
            if cancelled {
                break;
            }
        }
        results
    }
}
