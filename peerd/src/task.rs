use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{io, thread};

use tracing::{error, warn};

/// Thread handle that joins the thread when dropped
pub struct AutoJoinHandle {
    name: String,
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let join_handle = thread::Builder::new()
            .name(format!("peerd-{name}"))
            .spawn(f)?;
        Ok(Self {
            name: name.to_owned(),
            join_handle: Some(join_handle),
        })
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!(thread = %self.name, "Task thread panicked");
            }
        }
    }
}

/// Flips the node's shutdown flag if the task it guards panics
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn panic_guard_sets_flag_on_panic() {
    let flag = Arc::new(AtomicBool::new(false));

    let handle = AutoJoinHandle::spawn("panicky", {
        let flag = flag.clone();
        move || {
            let _guard = PanicGuard::new("panicky", flag);
            panic!("expected");
        }
    })
    .unwrap();
    drop(handle);
    assert!(flag.load(Ordering::SeqCst));

    let flag = Arc::new(AtomicBool::new(false));
    let guard = PanicGuard::new("calm", flag.clone());
    guard.done();
    assert!(!flag.load(Ordering::SeqCst));
}
