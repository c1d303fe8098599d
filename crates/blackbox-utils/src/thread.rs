use std::thread::{Builder, JoinHandle};

/// Spawns a named OS thread.
pub fn spawn_named<F, T>(name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("couldn't spawn thread")
}
