use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Single-shot timer that fires a deferred "stopped typing" signal.
///
/// Restarting replaces the pending timer instead of stacking another one, so at
/// most one deferred signal is ever outstanding.
pub struct TypingTimer {
    timeout: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TypingTimer {
    pub fn new(timeout: Duration) -> Self {
        TypingTimer {
            timeout,
            pending: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restart<F>(&self, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire.await;
        });
        if let Some(previous) = self.slot().replace(handle) {
            previous.abort();
        }
    }

    /// Returns whether a timer was still pending.
    pub fn cancel(&self) -> bool {
        match self.slot().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TypingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Text for the "... is typing" indicator, `None` when nobody is typing.
pub fn typing_label(users: &[String]) -> Option<String> {
    match users {
        [] => None,
        [one] => Some(format!("{one} is typing")),
        [first, second] => Some(format!("{first} and {second} are typing")),
        many => Some(format!("{} people are typing", many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        let make = move || {
            let fired = Arc::clone(&handle);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_timeout() {
        let timer = TypingTimer::new(Duration::from_millis(3000));
        assert_eq!(timer.timeout(), Duration::from_millis(3000));
        let (fired, make) = counter();

        timer.restart(make());
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_debounces() {
        let timer = TypingTimer::new(Duration::from_millis(3000));
        let (fired, make) = counter();

        for _ in 0..5 {
            timer.restart(make());
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timer = TypingTimer::new(Duration::from_millis(3000));
        let (fired, make) = counter();

        timer.restart(make());
        assert!(timer.is_pending());
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn labels() {
        let names = |list: &[&str]| list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
        assert_eq!(typing_label(&[]), None);
        assert_eq!(typing_label(&names(&["Alice"])).unwrap(), "Alice is typing");
        assert_eq!(
            typing_label(&names(&["Alice", "Bob"])).unwrap(),
            "Alice and Bob are typing"
        );
        assert_eq!(
            typing_label(&names(&["Alice", "Bob", "Cara"])).unwrap(),
            "3 people are typing"
        );
    }
}
