//! Thin wrapper around the async runtime hosting the engine task.
//!
//! The engine itself only ever needs one worker thread (it is a
//! single-threaded cooperative loop, see `engine::context`); extra
//! threads are only useful so that off-loop callers (e.g. `write()`)
//! don't block the engine task while they wait for their submission to
//! be accepted.

pub type JoinHandle<T> = ::tokio::task::JoinHandle<T>;

pub type Runtime = ::tokio::runtime::Runtime;

pub fn init(num_threads: usize) -> Result<Runtime, ()> {
    ::tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads.max(1))
        .thread_name("meshline-worker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .map_err(|_| ())
}

pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    ::tokio::task::spawn(fut)
}
