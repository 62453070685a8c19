use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};

/// Blocks the current thread on a future until it completes.
///
/// Handlers run on blocking worker threads, so whenever the dispatcher needs
/// a value that arrives asynchronously (the response of an exchange, the next
/// chunk of a request body) it parks the worker instead of spinning up a
/// runtime.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// Creates a parker bound to the calling thread.
    ///
    /// The parker starts in a parked state to ensure any wakeups that occur
    /// between polling and parking are not missed.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            parked: AtomicBool::new(true),
        })
    }

    /// Polls `fut` to completion, parking the thread between wakeups.
    pub fn block_on<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        let mut fut = pin!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(res) => break res,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

/// Runs `job` off the calling thread: on tokio's blocking pool when a runtime
/// is active, on a fresh thread otherwise.
///
/// The dispatcher hands its terminal here, so the terminal never runs inside
/// `Dispatcher::handle` or inside a layer's `next.run()`.
pub(crate) fn defer<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(job);
        }
        Err(_) => {
            let spawned = thread::Builder::new()
                .name("junction-terminal".to_owned())
                .spawn(job);
            if let Err(err) = spawned {
                log::error!("could not spawn a thread for the final handler: {}", err);
            }
        }
    }
}

/// Spawns hyper's background connection tasks onto the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}
