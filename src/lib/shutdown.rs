//! C11 — coordinates graceful shutdown across independently-registered handlers.
//!
//! `elba` itself is a one-shot CLI with nothing to tear down, so there is no direct analogue to
//! build on here; the interrupt trap rides `tokio::signal`, already part of the async runtime
//! dependency, rather than pulling in a separate signal-handling crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{FutureExt, Shared};
use slog::Logger;
use tokio::sync::Mutex;

use crate::err::Res;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn run(&self) -> Res<()>;
}

type SharedExit = Shared<Pin<Box<dyn Future<Output = i32> + Send>>>;

struct InFlight {
    exit_code: Arc<Mutex<i32>>,
    future: SharedExit,
}

pub struct Shutdown {
    log: Logger,
    timeout: Duration,
    handlers: Mutex<Vec<(i32, Arc<dyn ShutdownHook>)>>,
    inflight: Mutex<Option<InFlight>>,
}

impl Shutdown {
    pub fn new(log: Logger, timeout: Duration) -> Arc<Shutdown> {
        Arc::new(Shutdown { log, timeout, handlers: Mutex::new(Vec::new()), inflight: Mutex::new(None) })
    }

    pub async fn register(&self, priority: i32, handler: Arc<dyn ShutdownHook>) {
        self.handlers.lock().await.push((priority, handler));
    }

    /// Runs every registered handler in descending-priority order, then returns the recorded exit
    /// code. A second concurrent call while one is already in flight awaits the same run instead
    /// of starting another; `exit_code` only ever moves a recorded zero up to a nonzero value.
    pub async fn shutdown(self: &Arc<Self>, exit_code: Option<i32>) -> i32 {
        let requested = exit_code.unwrap_or(0);
        let mut slot = self.inflight.lock().await;

        let in_flight = match slot.as_ref() {
            Some(in_flight) => {
                let mut code = in_flight.exit_code.lock().await;
                if *code == 0 && requested != 0 {
                    *code = requested;
                }
                drop(code);
                InFlight { exit_code: in_flight.exit_code.clone(), future: in_flight.future.clone() }
            }
            None => {
                let exit_code = Arc::new(Mutex::new(requested));
                let this = self.clone();
                let code_for_run = exit_code.clone();
                let fut: Pin<Box<dyn Future<Output = i32> + Send>> = Box::pin(async move {
                    this.run_handlers().await;
                    *code_for_run.lock().await
                });
                let shared = fut.shared();
                let in_flight = InFlight { exit_code, future: shared };
                *slot = Some(InFlight {
                    exit_code: in_flight.exit_code.clone(),
                    future: in_flight.future.clone(),
                });
                in_flight
            }
        };
        drop(slot);

        in_flight.future.await
    }

    async fn run_handlers(&self) {
        let mut ordered = self.handlers.lock().await.clone();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        let chain = async {
            for (priority, handler) in ordered {
                if let Err(e) = handler.run().await {
                    slog::error!(self.log, "shutdown handler failed"; "priority" => priority, "error" => %e);
                }
            }
        };

        if tokio::time::timeout(self.timeout, chain).await.is_err() {
            slog::error!(self.log, "shutdown timed out"; "timeout_ms" => self.timeout.as_millis() as u64);
        }
    }
}

#[cfg(unix)]
async fn next_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn next_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Waits for the first interrupt, requests a graceful `shutdown(0)`, then races a second interrupt
/// against the handler chain: a second signal during an active shutdown force-exits with code 1.
/// Resolves to the final exit code once shutdown completes without a repeated interrupt.
pub async fn watch_for_signals(shutdown: Arc<Shutdown>) -> i32 {
    next_interrupt().await;
    let mut shutting_down = Box::pin(shutdown.shutdown(Some(0)));
    tokio::select! {
        code = &mut shutting_down => code,
        _ = next_interrupt() => {
            eprintln!("second interrupt received, forcing exit");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::{Error, ErrorKind};
    use crate::test_support::test_logger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHook {
        id: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl ShutdownHook for RecordingHook {
        async fn run(&self) -> Res<()> {
            self.order.lock().unwrap().push(self.id);
            if self.fail {
                return Err(Error::from(ErrorKind::Other("boom".to_string())));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_run_in_descending_priority_order() {
        let shutdown = Shutdown::new(test_logger(), Duration::from_secs(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        shutdown
            .register(1, Arc::new(RecordingHook { id: "low", order: order.clone(), fail: false }))
            .await;
        shutdown
            .register(10, Arc::new(RecordingHook { id: "high", order: order.clone(), fail: false }))
            .await;
        shutdown
            .register(5, Arc::new(RecordingHook { id: "mid", order: order.clone(), fail: false }))
            .await;

        let code = shutdown.shutdown(None).await;
        assert_eq!(code, 0);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_halt_the_chain() {
        let shutdown = Shutdown::new(test_logger(), Duration::from_secs(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        shutdown
            .register(10, Arc::new(RecordingHook { id: "first", order: order.clone(), fail: true }))
            .await;
        shutdown
            .register(1, Arc::new(RecordingHook { id: "second", order: order.clone(), fail: false }))
            .await;

        shutdown.shutdown(None).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn nonzero_exit_code_overrides_zero_but_not_the_reverse() {
        let shutdown = Shutdown::new(test_logger(), Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        struct SlowHook(Arc<AtomicUsize>);
        #[async_trait]
        impl ShutdownHook for SlowHook {
            async fn run(&self) -> Res<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::delay_for(Duration::from_millis(50)).await;
                Ok(())
            }
        }
        shutdown.register(0, Arc::new(SlowHook(calls.clone()))).await;

        let shutdown2 = shutdown.clone();
        let first = tokio::spawn(async move { shutdown2.shutdown(None).await });
        tokio::time::delay_for(Duration::from_millis(5)).await;
        let second = shutdown.shutdown(Some(7)).await;
        let first = first.await.unwrap();

        assert_eq!(first, 7);
        assert_eq!(second, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
