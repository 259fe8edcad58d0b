use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::policy::region::RegionIdx;
use crate::util::Address;
use crate::vm::{AgePolicy, ObjectFiller, RegionBinding};

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    let _lock = SERIAL_TEST_LOCK.lock();
    f();
}

// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}

/// A fake heap base for tests. Nothing is ever mapped or dereferenced there,
/// the engine only does address arithmetic on it. One gigabyte alignment keeps
/// it region aligned for every supported region size.
pub const TEST_HEAP_START: Address = unsafe { Address::from_usize(0x4000_0000) };

lazy_static! {
    static ref FILL_CALLS: Mutex<Vec<(Address, usize)>> = Mutex::new(vec![]);
    static ref EDEN_CALLS: Mutex<Vec<(RegionIdx, usize)>> = Mutex::new(vec![]);
    static ref SURVIVOR_CALLS: Mutex<Vec<(RegionIdx, usize)>> = Mutex::new(vec![]);
}

/// A binding that records every callback it receives so tests can assert on
/// them. The recorders are global, so tests using `MockBinding` should run
/// under [`serial_test`] and call [`MockBinding::reset`] first.
pub struct MockBinding;

impl RegionBinding for MockBinding {
    type Filler = MockFiller;
    type Policy = MockPolicy;
}

impl MockBinding {
    pub fn reset() {
        FILL_CALLS.lock().unwrap().clear();
        EDEN_CALLS.lock().unwrap().clear();
        SURVIVOR_CALLS.lock().unwrap().clear();
    }

    pub fn fill_calls() -> Vec<(Address, usize)> {
        FILL_CALLS.lock().unwrap().clone()
    }

    pub fn eden_calls() -> Vec<(RegionIdx, usize)> {
        EDEN_CALLS.lock().unwrap().clone()
    }

    pub fn survivor_calls() -> Vec<(RegionIdx, usize)> {
        SURVIVOR_CALLS.lock().unwrap().clone()
    }
}

pub struct MockFiller;

impl ObjectFiller for MockFiller {
    const MIN_FILL_WORDS: usize = 2;

    fn fill(start: Address, words: usize) {
        // Record only. The test heap is never mapped, so there is nothing to write.
        FILL_CALLS.lock().unwrap().push((start, words));
    }
}

pub struct MockPolicy;

impl AgePolicy for MockPolicy {
    fn record_eden_region(region: RegionIdx, eden_index: usize) {
        EDEN_CALLS.lock().unwrap().push((region, eden_index));
    }

    fn record_survivor_region(region: RegionIdx, young_index: usize) {
        SURVIVOR_CALLS.lock().unwrap().push((region, young_index));
    }
}
