//! Synchronization utilities shared by the engine and its test harness.

use std::sync::Arc;

use tokio::sync::{
    mpsc,
    Semaphore,
};

pub struct RendezvousSender<T> {
    semaphore: Arc<Semaphore>,
    channel: mpsc::Sender<T>,
}

impl<T> RendezvousSender<T> {
    pub async fn send(&mut self, value: T) -> anyhow::Result<()> {
        // Wait for the receiver to be ready.
        let permit = self.semaphore.acquire().await?;

        // Forget the permit once we acquire it -- if the future is canceled
        // past this point, we want to wait for another spot in the semaphore.
        permit.forget();

        self.channel
            .send(value)
            .await
            .map_err(|_| anyhow::anyhow!("Failed to send value"))
    }

    pub fn try_send(&mut self, value: T) -> anyhow::Result<()> {
        let permit = self.semaphore.try_acquire()?;
        permit.forget();
        self.channel
            .try_send(value)
            .map_err(|_| anyhow::anyhow!("Failed to send value"))
    }
}

pub struct RendezvousReceiver<T> {
    semaphore: Arc<Semaphore>,
    channel: mpsc::Receiver<T>,
}

impl<T> RendezvousReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.semaphore.add_permits(1);
        self.channel.recv().await
    }

    pub fn close(mut self) {
        self.semaphore.close();
        self.channel.close();
    }
}

/// Simulate a zero-capacity SPSC channel, where the sender blocks until the
/// receiver is blocked on receiving from the channel.
pub fn rendezvous<T>() -> (RendezvousSender<T>, RendezvousReceiver<T>) {
    // NB: tokio::mpsc doesn't support zero-capacity channels, so simulate it
    // with a semaphore and a channel.
    let semaphore = Arc::new(Semaphore::new(0));
    let (tx, rx) = mpsc::channel(1);
    (
        RendezvousSender {
            semaphore: semaphore.clone(),
            channel: tx,
        },
        RendezvousReceiver {
            semaphore,
            channel: rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use crate::sync::rendezvous;

    #[tokio::test]
    async fn test_rendezvous_blocks_sender_until_receiver_ready() -> anyhow::Result<()> {
        let (mut tx, mut rx) = rendezvous::<u32>();
        assert!(tx.try_send(1).is_err());

        let send = tokio::spawn(async move {
            tx.send(2).await?;
            anyhow::Ok(())
        });
        assert_eq!(rx.recv().await, Some(2));
        send.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_rendezvous_close_unblocks_sender() {
        let (mut tx, rx) = rendezvous::<u32>();
        rx.close();
        assert!(tx.send(3).await.is_err());
    }
}
