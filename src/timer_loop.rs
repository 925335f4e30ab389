use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{Receiver, select};

use crate::{CacheKey, CacheTable};

/// Why the sweeper thread woke up.
enum Wake {
    Rescheduled,
    Deadline,
    Disconnected,
}

pub struct TimerLoop;

impl TimerLoop {
    /// Spawns the sweeper thread of `table`.
    ///
    /// The thread blocks until either the table's scheduled wake time is reached,
    /// in which case it runs an expiration check, or a wake-up arrives on `wake`,
    /// in which case it re-reads the wake time (an earlier deadline, or none after
    /// a flush). It only keeps a weak reference to the table and returns once all
    /// handles are gone, which also disconnects `wake`.
    ///
    /// A callback panicking during an expiration check is logged and the loop
    /// goes on, so the table keeps expiring items.
    pub fn run<K: CacheKey>(
        table: &CacheTable<K>,
        wake: Receiver<()>,
        thread_name: String,
    ) -> std::io::Result<()> {
        let weak = table.downgrade();

        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                loop {
                    let deadline = match weak.upgrade() {
                        Some(table) => table.cleanup_at(),
                        None => break,
                    };
                    let timeout = match deadline {
                        Some(at) => crossbeam_channel::at(at),
                        None => crossbeam_channel::never(),
                    };

                    let woke = select! {
                        recv(wake) -> signal => match signal {
                            Ok(()) => Wake::Rescheduled,
                            Err(_) => Wake::Disconnected,
                        },
                        recv(timeout) -> _ => Wake::Deadline,
                    };

                    match woke {
                        Wake::Rescheduled => continue,
                        Wake::Disconnected => break,
                        Wake::Deadline => match weak.upgrade() {
                            Some(table) => {
                                let pass = panic::catch_unwind(AssertUnwindSafe(|| {
                                    table.expiration_check()
                                }));
                                if let Err(payload) = pass {
                                    table.report_sweep_panic(payload.as_ref());
                                }
                            }
                            None => break,
                        },
                    }
                }
                log::debug!(target: crate::LOG_TARGET, "Sweeper thread stopped, table dropped");
            })?;
        Ok(())
    }
}
