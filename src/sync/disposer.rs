use tokio::task::JoinHandle;

/// Owns a background task (timer, ticker, subscription pump) and cancels it on
/// dispose or drop. Disposing twice is a no-op.
#[derive(Debug, Default)]
pub struct Disposer {
    handle: Option<JoinHandle<()>>,
}

impl Disposer {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::new(tokio::spawn(future))
    }

    /// Returns `true` if this call actually cancelled something.
    pub fn dispose(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent() {
        let mut disposer = Disposer::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(disposer.is_active());
        assert!(disposer.dispose());
        assert!(!disposer.dispose());
        assert!(!disposer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_task() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let disposer = Disposer::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(());
        });
        drop(disposer);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.recv().await.is_none());
    }
}
