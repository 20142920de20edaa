//! One-shot completion signal shared by the pool, the cron scheduler and the runner.

use tokio::sync::watch;

use drudge_core::{Error, Result};

type Outcome = Option<Result<()>>;

/// Settles a [`Completion`] exactly once; later settles are ignored.
#[derive(Debug)]
pub struct CompletionSender {
    tx: watch::Sender<Outcome>,
}

/// Awaitable outcome of a subsystem. Cloning shares the same outcome.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Outcome>,
}

/// Create a linked sender/completion pair.
pub fn completion() -> (CompletionSender, Completion) {
    let (tx, rx) = watch::channel(None);
    (CompletionSender { tx }, Completion { rx })
}

impl CompletionSender {
    /// Settle with `result`. Returns false if already settled.
    pub fn settle(&self, result: Result<()>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = result.take();
            true
        })
    }
}

impl Completion {
    /// Wait until settled. Every waiter gets its own copy of a failure,
    /// with the original variant.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Fatal("Subsystem dropped without settling".to_string()))?;
        match settled.as_ref() {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e.duplicate()),
            None => Err(Error::Internal("Completion woke unsettled".to_string())),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
