mod assert;
pub mod directories;
mod sanitize;
mod thread;

pub use sanitize::sanitize_app_filename;
pub use thread::spawn_named;
