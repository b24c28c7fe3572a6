/// A task which is executed by an [`AsyncExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs background work of the cell database.
pub trait AsyncExecutor: Send + Sync {
    /// Schedules the task without waiting for it.
    fn execute_async(&self, task: Task);

    /// Executes the task and waits for its completion.
    fn execute_sync(&self, task: Task) {
        task();
    }
}

impl<T: AsyncExecutor + ?Sized> AsyncExecutor for std::sync::Arc<T> {
    #[inline]
    fn execute_async(&self, task: Task) {
        T::execute_async(self, task);
    }

    #[inline]
    fn execute_sync(&self, task: Task) {
        T::execute_sync(self, task);
    }
}

/// Spawns a new OS thread for each task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl AsyncExecutor for ThreadExecutor {
    fn execute_async(&self, task: Task) {
        let task = std::sync::Arc::new(parking_lot::Mutex::new(Some(task)));
        let spawned = std::thread::Builder::new().name("cellar-worker".to_owned()).spawn({
            let task = task.clone();
            move || {
                if let Some(task) = task.lock().take() {
                    task();
                }
            }
        });

        if let Err(e) = spawned {
            tracing::error!("failed to spawn a worker thread, running inline: {e}");
            if let Some(task) = task.lock().take() {
                task();
            }
        }
    }
}

/// Executes tasks on the global rayon thread pool.
#[cfg(feature = "rayon")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonExecutor;

#[cfg(feature = "rayon")]
impl AsyncExecutor for RayonExecutor {
    fn execute_async(&self, task: Task) {
        rayon::spawn(task);
    }

    fn execute_sync(&self, task: Task) {
        rayon::scope(|_| task());
    }
}
