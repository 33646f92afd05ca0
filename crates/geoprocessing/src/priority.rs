//! Best effort lowering of the scheduling priority of worker threads.

/// Niceness added to the current niceness of the thread.
pub const NICENESS_INCREMENT: i32 = 10;

/// Lowest priority supported by the scheduler.
pub const MAX_NICENESS: i32 = 19;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Lowers the scheduling priority of the calling thread, returns `false` when this failed.
        /// On linux the niceness is a per thread attribute, other unix systems apply it to the process.
        pub fn lower_thread_priority() -> bool {
            // SAFETY: plain system calls without pointer arguments
            let result = unsafe {
                let current = libc::getpriority(libc::PRIO_PROCESS, 0);
                libc::setpriority(libc::PRIO_PROCESS, 0, (current + NICENESS_INCREMENT).min(MAX_NICENESS))
            };

            if result != 0 {
                log::warn!("Failed to lower the scheduling priority: {}", std::io::Error::last_os_error());
                return false;
            }

            true
        }
    } else {
        /// Lowering the priority is not supported on this platform.
        pub fn lower_thread_priority() -> bool {
            log::debug!("Lowering the scheduling priority is not supported on this platform");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_priority_on_worker_thread() {
        let handle = std::thread::spawn(lower_thread_priority);
        let lowered = handle.join().expect("thread should not panic");
        assert_eq!(lowered, cfg!(unix));
    }
}
