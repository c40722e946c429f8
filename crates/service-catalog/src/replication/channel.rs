//! Bounded channel whose sends give up after a timeout

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError};
use std::time::Duration;

/// Create a bounded channel with a timeout-guarded sender
pub fn timeout_channel<T>(capacity: usize) -> (TimeoutSender<T>, Receiver<T>) {
    let (tx, rx) = async_channel::bounded(capacity);
    (TimeoutSender { inner: tx }, rx)
}

/// Sender that fails instead of blocking forever on a stalled consumer
#[derive(Debug)]
pub struct TimeoutSender<T> {
    inner: Sender<T>,
}

impl<T> Clone for TimeoutSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TimeoutSender<T> {
    /// Queue `item`, waiting at most `timeout` for room
    pub async fn send(&self, item: T, timeout: Duration) -> Result<()> {
        let item = match self.inner.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(Error::ChannelClosed),
            Err(TrySendError::Full(item)) => item,
        };

        smol::future::or(
            async { self.inner.send(item).await.map_err(|_| Error::ChannelClosed) },
            async {
                smol::Timer::after(timeout).await;
                Err(Error::ChannelTimeout(timeout))
            },
        )
        .await
    }

    /// Close the channel; queued items can still be received
    pub fn close(&self) -> bool {
        self.inner.close()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_send_times_out_when_full() {
        let (tx, rx) = timeout_channel(1);
        tx.send(1, Duration::from_millis(10)).await.unwrap();

        let err = tx.send(2, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, Error::ChannelTimeout(_)));

        assert_eq!(rx.recv().await.unwrap(), 1);
        tx.send(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[smol_potat::test]
    async fn test_send_waits_for_room() {
        let (tx, rx) = timeout_channel(1);
        tx.send(1, Duration::from_millis(10)).await.unwrap();

        let consumer = smol::spawn(async move {
            smol::Timer::after(Duration::from_millis(20)).await;
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            (first, second)
        });

        tx.send(2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(consumer.await, (1, 2));
    }

    #[smol_potat::test]
    async fn test_send_to_closed_channel() {
        let (tx, rx) = timeout_channel::<u32>(4);
        drop(rx);
        assert!(matches!(
            tx.send(1, Duration::from_millis(10)).await,
            Err(Error::ChannelClosed)
        ));
    }
}
