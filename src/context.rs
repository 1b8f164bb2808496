use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Причина, по которой контекст больше не действителен
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Контекст операции с кооперативной отменой.
///
/// Отмена сигнализируется через `watch` канал; операция сама проверяет
/// контекст в своих контрольных точках.
#[derive(Debug, Clone)]
pub struct OpContext {
    canceled: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Отменяет связанный `OpContext` и все его клоны
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl OpContext {
    /// Контекст, который никогда не отменяется
    pub fn background() -> Self {
        Self { canceled: None, deadline: None }
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { canceled: Some(rx), deadline: None }, CancelHandle { tx })
    }

    /// Дочерний контекст с ограничением по времени (берется меньший из дедлайнов)
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            canceled: self.canceled.clone(),
            deadline: Some(match self.deadline {
                Some(d) if d < deadline => d,
                _ => deadline,
            }),
        }
    }

    pub fn err(&self) -> Option<ContextError> {
        if let Some(rx) = &self.canceled {
            if *rx.borrow() {
                return Some(ContextError::Canceled);
            }
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Контрольная точка: Ok если контекст еще действителен
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Ждет отмены или истечения дедлайна
    pub async fn done(&self) -> ContextError {
        let canceled = async {
            match self.canceled.clone() {
                Some(mut rx) => {
                    if rx.wait_for(|c| *c).await.is_err() {
                        // отправитель удален без отмены
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = canceled => ContextError::Canceled,
            _ = deadline => ContextError::DeadlineExceeded,
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_canceled() {
        let ctx = OpContext::background();
        assert!(ctx.err().is_none());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let (ctx, handle) = OpContext::with_cancel();
        let clone = ctx.clone();
        assert!(ctx.err().is_none());
        handle.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        assert_eq!(clone.err(), Some(ContextError::Canceled));
        assert!(handle.is_canceled());
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let ctx = OpContext::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_on_cancel() {
        let (ctx, handle) = OpContext::with_cancel();
        let waiter = tokio::spawn(async move { ctx.done().await });
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), ContextError::Canceled);
    }
}
