//! Cross-context messaging.
//!
//! Two explicit channel kinds: a rendezvous [`AsyncChannel::call`] whose
//! handler answers through a typed [`Reply`], and a fire-and-forget
//! [`AsyncChannel::post`] for one-way notices. Calls go through a bounded
//! queue, so a busy device context applies back-pressure; notices never block
//! the sender.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// The receiving context is gone
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Answer slot carried inside a call message
#[derive(Debug)]
pub struct Reply<T>(oneshot::Sender<T>);

impl<T> Reply<T> {
    /// Answer the call. A caller that stopped waiting is ignored.
    pub fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

/// Something pulled off an [`AsyncReceiver`]
#[derive(Debug)]
pub enum Incoming<C, N> {
    /// A call awaiting a reply
    Call(C),
    /// A one-way notice
    Notice(N),
}

/// Sending half held by the originating context
#[derive(Debug)]
pub struct AsyncChannel<C, N> {
    calls: mpsc::Sender<C>,
    notices: mpsc::UnboundedSender<N>,
}

impl<C, N> Clone for AsyncChannel<C, N> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            notices: self.notices.clone(),
        }
    }
}

/// Receiving half owned by the handling context
#[derive(Debug)]
pub struct AsyncReceiver<C, N> {
    calls: mpsc::Receiver<C>,
    notices: mpsc::UnboundedReceiver<N>,
}

/// Create a channel pair whose call queue holds `capacity` messages
pub fn async_channel<C, N>(capacity: usize) -> (AsyncChannel<C, N>, AsyncReceiver<C, N>) {
    let (calls_tx, calls_rx) = mpsc::channel(capacity.max(1));
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();
    (
        AsyncChannel {
            calls: calls_tx,
            notices: notices_tx,
        },
        AsyncReceiver {
            calls: calls_rx,
            notices: notices_rx,
        },
    )
}

impl<C, N> AsyncChannel<C, N> {
    /// Send a call and wait for the handler's answer.
    ///
    /// # Errors
    /// Returns [`ChannelClosed`] if the handler is gone or dropped the reply.
    pub async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> C) -> Result<T, ChannelClosed> {
        let (tx, rx) = oneshot::channel();
        self.calls
            .send(build(Reply(tx)))
            .await
            .map_err(|_| ChannelClosed)?;
        rx.await.map_err(|_| ChannelClosed)
    }

    /// Queue a notice without waiting. Returns `false` if the handler is gone.
    pub fn post(&self, notice: N) -> bool {
        self.notices.send(notice).is_ok()
    }

    /// Whether the handler has shut down
    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }
}

impl<C, N> AsyncReceiver<C, N> {
    /// Wait for the next call or notice; `None` once every sender is gone.
    ///
    /// Notices are drained ahead of calls so that a notice posted before a
    /// call is seen first.
    pub async fn recv(&mut self) -> Option<Incoming<C, N>> {
        tokio::select! {
            biased;
            Some(notice) = self.notices.recv() => Some(Incoming::Notice(notice)),
            Some(call) = self.calls.recv() => Some(Incoming::Call(call)),
            else => None,
        }
    }

    /// Take whatever is queued without waiting
    pub fn try_recv(&mut self) -> Option<Incoming<C, N>> {
        if let Ok(notice) = self.notices.try_recv() {
            return Some(Incoming::Notice(notice));
        }
        self.calls.try_recv().ok().map(Incoming::Call)
    }
}

/// Post-only sender for unsolicited traffic back to the control context
#[derive(Debug)]
pub struct NoticeSender<N>(mpsc::UnboundedSender<N>);

impl<N> Clone for NoticeSender<N> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<N> NoticeSender<N> {
    /// Queue a notice. Returns `false` if the control context is gone.
    pub fn post(&self, notice: N) -> bool {
        self.0.send(notice).is_ok()
    }
}

/// Create a post-only channel
pub fn notice_channel<N>() -> (NoticeSender<N>, mpsc::UnboundedReceiver<N>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NoticeSender(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Call {
        Double(u32, Reply<u32>),
    }

    #[tokio::test]
    async fn call_round_trips_through_handler() {
        let (channel, mut receiver) = async_channel::<Call, &'static str>(4);

        let handler = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(incoming) = receiver.recv().await {
                match incoming {
                    Incoming::Call(Call::Double(n, reply)) => reply.send(n * 2),
                    Incoming::Notice(text) => seen.push(text),
                }
            }
            seen
        });

        assert!(channel.post("rate"));
        let doubled = channel.call(|reply| Call::Double(21, reply)).await;
        assert_eq!(doubled, Ok(42));

        drop(channel);
        let seen = handler.await.unwrap();
        assert_eq!(seen, vec!["rate"]);
    }

    #[tokio::test]
    async fn call_fails_when_handler_is_gone() {
        let (channel, receiver) = async_channel::<Call, ()>(1);
        drop(receiver);
        let result = channel.call(|reply| Call::Double(1, reply)).await;
        assert_eq!(result, Err(ChannelClosed));
        assert!(channel.is_closed());
    }
}
