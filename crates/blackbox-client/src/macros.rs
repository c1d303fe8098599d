/// Log through the global client at an explicit level. Ids for the call site
/// resolve once and stay cached in a per-site static.
#[macro_export]
macro_rules! bb_trace {
    ($level:expr, $category:expr, $($arg:tt)+) => {{
        static IDS: ::std::sync::atomic::AtomicU64 = ::std::sync::atomic::AtomicU64::new(0);
        let cached = IDS.load(::std::sync::atomic::Ordering::Relaxed);
        let (path_id, category_id) = if cached == 0 {
            let ids = $crate::global().resolve_ids(file!(), $category, line!());
            IDS.store(
                (u64::from(ids.0) << 32) | u64::from(ids.1),
                ::std::sync::atomic::Ordering::Relaxed,
            );
            ids
        } else {
            ((cached >> 32) as u32, cached as u32)
        };
        $crate::global().trace(path_id, line!(), category_id, $level, 0, format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! bb_log {
    ($category:expr, $($arg:tt)+) => {
        $crate::bb_trace!($crate::LogLevel::Log, $category, $($arg)+)
    };
}

#[macro_export]
macro_rules! bb_warning {
    ($category:expr, $($arg:tt)+) => {
        $crate::bb_trace!($crate::LogLevel::Warning, $category, $($arg)+)
    };
}

#[macro_export]
macro_rules! bb_error {
    ($category:expr, $($arg:tt)+) => {
        $crate::bb_trace!($crate::LogLevel::Error, $category, $($arg)+)
    };
}

/// Announce the calling thread under `$name`.
#[macro_export]
macro_rules! bb_thread_start {
    ($name:expr) => {{
        let path_id = $crate::global().resolve_path_id(file!(), line!());
        $crate::global().thread_start(path_id, line!(), $name);
    }};
}

#[macro_export]
macro_rules! bb_thread_set_name {
    ($name:expr) => {{
        let path_id = $crate::global().resolve_path_id(file!(), line!());
        $crate::global().thread_set_name(path_id, line!(), $name);
    }};
}

#[macro_export]
macro_rules! bb_thread_end {
    () => {{
        let path_id = $crate::global().resolve_path_id(file!(), line!());
        $crate::global().thread_end(path_id, line!());
    }};
}

#[macro_export]
macro_rules! bb_shutdown {
    () => {
        $crate::global().shutdown(file!(), line!())
    };
}
