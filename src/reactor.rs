//! Thin wrapper around the mio poll loop.
//!
//! The reactor owns the poll instance, the cross-thread waker and the
//! deferred task queue. The thread that creates the reactor is the event
//! loop thread; everything except `Remote` must stay on it.

use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the waker; never assigned to a client.
pub const WAKER_TOKEN: Token = Token(::std::usize::MAX - 1);

/// Work posted to the loop thread from outside.
pub enum Task {
    /// Arbitrary closure, run on the loop thread.
    Run(Box<dyn FnOnce() + Send>),
    /// Release one detached reference registered under this id.
    ReleaseRef(u64),
}

struct Shared {
    tasks: Mutex<Vec<Task>>,
    waker: Waker,
}

pub struct Reactor {
    poll: Poll,
    shared: Arc<Shared>,
    loop_thread: ThreadId,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Reactor {
            poll: poll,
            shared: Arc::new(Shared {
                tasks: Mutex::new(Vec::new()),
                waker: waker,
            }),
            loop_thread: thread::current().id(),
        })
    }

    /// Wait for readiness events. A signal interruption is reported as an
    /// empty event set, not an error.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>)
        -> io::Result<()>
    {
        match self.poll.poll(events, timeout) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn register<S: Source + ?Sized>(&self, source: &mut S, token: Token,
        interests: Interest) -> io::Result<()>
    {
        self.poll.registry().register(source, token, interests)
    }

    pub fn reregister<S: Source + ?Sized>(&self, source: &mut S, token: Token,
        interests: Interest) -> io::Result<()>
    {
        self.poll.registry().reregister(source, token, interests)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S)
        -> io::Result<()>
    {
        self.poll.registry().deregister(source)
    }

    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Handle for posting work from other threads.
    pub fn remote(&self) -> Remote {
        Remote { shared: self.shared.clone() }
    }

    /// Drain the queue of posted tasks.
    pub fn take_tasks(&self) -> Vec<Task> {
        let mut tasks = self.shared.tasks.lock()
            .expect("reactor task queue poisoned");
        mem::replace(&mut *tasks, Vec::new())
    }
}

/// Cloneable, Send handle to the reactor's task queue.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    /// Post a closure to run on the loop thread.
    pub fn run_later<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.post(Task::Run(Box::new(f)));
    }

    /// Post a detached-reference release to the loop thread.
    pub fn release_ref(&self, id: u64) {
        self.post(Task::ReleaseRef(id));
    }

    fn post(&self, task: Task) {
        self.shared.tasks.lock()
            .expect("reactor task queue poisoned")
            .push(task);
        if let Err(e) = self.shared.waker.wake() {
            error!("failed to wake event loop: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use mio::Events;

    use super::{Reactor, Task};

    #[test]
    fn test_remote_task_wakes_loop() {
        let mut reactor = Reactor::new().unwrap();
        assert!(reactor.on_loop_thread());
        let remote = reactor.remote();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.run_later(move || ran2.store(true, Ordering::SeqCst));
        });

        let mut events = Events::with_capacity(8);
        // blocks until the waker fires
        reactor.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        for task in reactor.take_tasks() {
            match task {
                Task::Run(f) => f(),
                Task::ReleaseRef(_) => panic!("unexpected task"),
            }
        }
        assert!(ran.load(Ordering::SeqCst));
        poster.join().unwrap();
    }

    #[test]
    fn test_release_ref_task() {
        let reactor = Reactor::new().unwrap();
        reactor.remote().release_ref(42);
        let tasks = reactor.take_tasks();
        assert_eq!(tasks.len(), 1);
        match tasks.into_iter().next() {
            Some(Task::ReleaseRef(id)) => assert_eq!(id, 42),
            _ => panic!("unexpected task"),
        }
    }
}
