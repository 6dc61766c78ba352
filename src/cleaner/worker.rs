use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU8, Ordering::AcqRel, Ordering::Acquire, Ordering::Release},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::JoinHandle,
};

use super::driver::{Driver, Pass};
use crate::{utils::options::ParsedOptions, OpCode};

const CLEANER_QUIT: i32 = -1;

/// lifecycle of the background cleaner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl From<u8> for State {
    fn from(x: u8) -> Self {
        match x {
            0 => State::Idle,
            1 => State::Running,
            2 => State::StopRequested,
            _ => State::Stopped,
        }
    }
}

pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Idle as u8),
        }
    }

    pub(crate) fn get(&self) -> State {
        self.state.load(Acquire).into()
    }

    pub(crate) fn set(&self, s: State) {
        self.state.store(s as u8, Release);
    }

    /// move from `current` to `new`, return the state found
    pub(crate) fn transit(&self, current: State, new: State) -> State {
        self.state
            .compare_exchange(current as u8, new as u8, AcqRel, Acquire)
            .unwrap_or_else(|x| x)
            .into()
    }
}

fn cleaner_thread(
    driver: Arc<Mutex<Driver>>,
    life: Arc<Lifecycle>,
    opt: Arc<ParsedOptions>,
    rx: Receiver<i32>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("log_cleaner".into())
        .spawn(move || {
            loop {
                // a stop is only observed between passes, never in the middle of one
                if life.get() == State::StopRequested {
                    break;
                }
                let timeout = match driver.lock().do_work() {
                    Ok(Pass::Idle) => opt.poll_interval(),
                    Ok(_) => continue,
                    Err(_) => opt.backoff(),
                };
                match rx.recv_timeout(timeout) {
                    Ok(CLEANER_QUIT) => break,
                    Ok(x) => log::error!("invalid instruction {}", x),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("cleaner thread quit");
        })
}

pub(crate) struct Handle {
    tx: Sender<i32>,
    thread: JoinHandle<()>,
}

impl Handle {
    /// wake the thread if it's sleeping and wait for it to exit
    pub(crate) fn quit(self) {
        let _ = self.tx.send(CLEANER_QUIT);
        if self.thread.join().is_err() {
            log::error!("cleaner thread panicked");
        }
    }
}

pub(crate) fn start_cleaner(
    driver: Arc<Mutex<Driver>>,
    life: Arc<Lifecycle>,
    opt: Arc<ParsedOptions>,
) -> Result<Handle, OpCode> {
    let (tx, rx) = channel();
    let thread = cleaner_thread(driver, life, opt, rx).map_err(|e| {
        log::error!("can't spawn cleaner thread, error {}", e);
        OpCode::Again
    })?;
    Ok(Handle { tx, thread })
}

#[cfg(test)]
mod test {
    use super::{Lifecycle, State};

    #[test]
    fn transitions() {
        let l = Lifecycle::new();
        assert_eq!(l.get(), State::Idle);
        assert_eq!(l.transit(State::Idle, State::Running), State::Idle);
        assert_eq!(l.get(), State::Running);
        assert_eq!(l.transit(State::Idle, State::Running), State::Running);
        l.set(State::Stopped);
        assert_eq!(l.get(), State::Stopped);
    }
}
