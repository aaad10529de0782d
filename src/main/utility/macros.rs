/// Log a warning about a violated assumption, and additionally panic in
/// debug builds so the backtrace points at it. Release builds keep running
/// after the warning.
#[macro_export]
macro_rules! debug_panic {
    ($($x:tt)+) => {{
        log::warn!($($x)+);
        if cfg!(debug_assertions) {
            panic!($($x)+);
        }
    }};
}

#[cfg(test)]
mod tests {
    // panics under `cargo test`, only warns under `cargo test --release`
    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn test_debug_panic() {
        crate::debug_panic!("an invariant was violated");
    }
}
