//! Runs lifecycle work (provider init/shutdown, event bridging) off the caller's path.
use std::future::Future;

/// Spawn `future` as a background task.
///
/// When called from within a tokio runtime the task is spawned onto it. Otherwise a named thread
/// is started that drives the future on its own current-thread runtime, so synchronous callers
/// can bind providers too.
pub(crate) fn spawn<F>(name: &str, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    let result = std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!(target: "flagbridge", "failed to start background runtime: {err}");
                    return;
                }
            };
            runtime.block_on(future);
        });

    if let Err(err) = result {
        log::error!(target: "flagbridge", "failed to spawn background thread: {err}");
    }
}
