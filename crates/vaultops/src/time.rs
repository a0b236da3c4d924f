use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Milliseconds since the Unix epoch.
///
/// ID generation, retry deadlines and persisted timestamps all read time
/// through this trait, so tests can substitute a fixed or scripted clock.
///
/// # Example
///
/// ```
/// use vaultops::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource<u64> for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.current_millis(), 1234);
/// ```
pub trait TimeSource<T> {
    fn current_millis(&self) -> T;
}

impl<T, S> TimeSource<T> for Arc<S>
where
    S: TimeSource<T> + ?Sized,
{
    fn current_millis(&self) -> T {
        (**self).current_millis()
    }
}

#[derive(Debug)]
struct Ticker {
    /// Milliseconds elapsed since the clock was created.
    elapsed: AtomicU64,
    _thread: OnceLock<JoinHandle<()>>,
}

/// Unix-millisecond clock that never runs backwards.
///
/// The wall clock is read once at construction; after that a background
/// thread advances an elapsed-time counter from [`Instant`], so NTP steps do
/// not reorder operation IDs or backoff deadlines. Reads are a single atomic
/// load. Clones share the ticker, which stops once the last clone is dropped.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    ticker: Arc<Ticker>,
    origin: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// # Panics
    ///
    /// Panics if the system clock reads earlier than the Unix epoch.
    pub fn new() -> Self {
        let started = Instant::now();
        let origin = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System clock before UNIX_EPOCH")
            .as_millis() as u64;

        let ticker = Arc::new(Ticker {
            elapsed: AtomicU64::new(0),
            _thread: OnceLock::new(),
        });

        let weak = Arc::downgrade(&ticker);
        let thread = thread::spawn(move || {
            let mut next = 0;
            while let Some(ticker) = weak.upgrade() {
                let due = started + Duration::from_millis(next);
                let now = Instant::now();
                if now < due {
                    thread::sleep(due - now);
                }

                let elapsed = started.elapsed().as_millis() as u64;
                ticker.elapsed.store(elapsed, Ordering::Relaxed);
                next = elapsed + 1;
            }
        });
        let _ = ticker._thread.set(thread);

        Self { ticker, origin }
    }
}

impl TimeSource<u64> for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.origin + self.ticker.elapsed.load(Ordering::Relaxed)
    }
}
