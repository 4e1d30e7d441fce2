use std::future::Future;

/// Background unit of work started by the controller.
///
/// The generic parameter `H` is the handle returned when the worker starts, `S` the state
/// observable through that handle.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    type Error;

    /// Spawns the worker and returns immediately with its handle.
    fn start(self) -> impl Future<Output = Result<H, Self::Error>> + Send;
}

/// Handle for observing and awaiting a running worker.
pub trait WorkerHandle<S> {
    /// Result produced when the worker finishes.
    type Output;

    /// Snapshot of the worker's current state. Holding it does not keep the worker alive.
    fn state(&self) -> S;

    /// Waits for the worker to finish. The handle is consumed.
    fn wait(self) -> impl Future<Output = Self::Output> + Send;
}
