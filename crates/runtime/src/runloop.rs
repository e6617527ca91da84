//! Per-thread cooperative run loop
//!
//! Each execution instance runs one loop on its own thread. The loop
//! multiplexes file-descriptor monitors through `poll(2)` and fires
//! interval timers; all callbacks execute on the loop thread, so no
//! state they touch needs locking.
//!
//! Monitors subscribe to a mask of readiness events. Installing or
//! removing a monitor takes effect on the next poll round, which is
//! atomic as far as callbacks can observe. Attaching a monitor forces
//! the descriptor into non-blocking mode.

use crate::error::{set_last_error, Error};
use enumflags2::{bitflags, BitFlags};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Readiness conditions a monitor can subscribe to.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    In = 0x01,
    Out = 0x02,
    Hup = 0x04,
    Err = 0x08,
    Nval = 0x10,
}

pub type IoEvents = BitFlags<IoEvent>;

/// Returning `false` removes the monitor.
pub type IoCallback = Rc<dyn Fn(RawFd, IoEvents) -> bool>;

/// Returning `false` stops the timer.
pub type TimerCallback = Rc<dyn Fn() -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

struct Monitor {
    fd: RawFd,
    events: IoEvents,
    cb: IoCallback,
}

struct Timer {
    interval: Duration,
    due: Instant,
    cb: TimerCallback,
}

#[derive(Default)]
struct Inner {
    monitors: Vec<Option<Monitor>>,
    free_monitors: Vec<usize>,
    timers: Vec<Option<Timer>>,
    free_timers: Vec<usize>,
    quit: bool,
}

pub struct RunLoop {
    inner: RefCell<Inner>,
}

thread_local! {
    static CURRENT: Rc<RunLoop> = Rc::new(RunLoop {
        inner: RefCell::new(Inner::default()),
    });
}

fn to_poll_mask(events: IoEvents) -> i16 {
    let mut mask = 0i16;
    if events.contains(IoEvent::In) {
        mask |= libc::POLLIN;
    }
    if events.contains(IoEvent::Out) {
        mask |= libc::POLLOUT;
    }
    mask
}

fn from_poll_mask(revents: i16) -> IoEvents {
    let mut out = IoEvents::empty();
    if revents & libc::POLLIN != 0 {
        out |= IoEvent::In;
    }
    if revents & libc::POLLOUT != 0 {
        out |= IoEvent::Out;
    }
    if revents & libc::POLLHUP != 0 {
        out |= IoEvent::Hup;
    }
    if revents & libc::POLLERR != 0 {
        out |= IoEvent::Err;
    }
    if revents & libc::POLLNVAL != 0 {
        out |= IoEvent::Nval;
    }
    out
}

/// Force `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    // Safety: plain fcntl on a descriptor we were handed
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(set_last_error(Error::IoFailure));
        }
    }
    Ok(())
}

impl RunLoop {
    /// The calling thread's run loop.
    pub fn current() -> Rc<RunLoop> {
        CURRENT.with(Rc::clone)
    }

    /// Watch `fd` for `events`; the descriptor is switched to
    /// non-blocking mode.
    pub fn install_monitor(
        &self,
        fd: RawFd,
        events: IoEvents,
        cb: IoCallback,
    ) -> Result<MonitorId, Error> {
        set_nonblocking(fd)?;
        let mut inner = self.inner.borrow_mut();
        let monitor = Monitor { fd, events, cb };
        let id = match inner.free_monitors.pop() {
            Some(slot) => {
                inner.monitors[slot] = Some(monitor);
                slot
            }
            None => {
                inner.monitors.push(Some(monitor));
                inner.monitors.len() - 1
            }
        };
        Ok(MonitorId(id))
    }

    /// Replace a monitor's event mask.
    pub fn modify_monitor(&self, id: MonitorId, events: IoEvents) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        match inner.monitors.get_mut(id.0).and_then(|m| m.as_mut()) {
            Some(m) => {
                m.events = events;
                Ok(())
            }
            None => Err(set_last_error(Error::NotFound)),
        }
    }

    pub fn remove_monitor(&self, id: MonitorId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.monitors.get_mut(id.0) {
            if slot.take().is_some() {
                inner.free_monitors.push(id.0);
            }
        }
    }

    /// Fire `cb` every `interval` until it returns false or is stopped.
    pub fn set_timer(&self, interval: Duration, cb: TimerCallback) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let timer = Timer {
            interval,
            due: Instant::now() + interval,
            cb,
        };
        let id = match inner.free_timers.pop() {
            Some(slot) => {
                inner.timers[slot] = Some(timer);
                slot
            }
            None => {
                inner.timers.push(Some(timer));
                inner.timers.len() - 1
            }
        };
        TimerId(id)
    }

    pub fn stop_timer(&self, id: TimerId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.timers.get_mut(id.0) {
            if slot.take().is_some() {
                inner.free_timers.push(id.0);
            }
        }
    }

    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }

    /// One poll-and-dispatch round. Returns whether anything ran.
    /// `timeout` bounds the wait; timers can shorten it.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        // snapshot monitors so callbacks may install/remove freely
        let (mut pollfds, ids): (Vec<libc::pollfd>, Vec<usize>) = {
            let inner = self.inner.borrow();
            let mut fds = Vec::new();
            let mut ids = Vec::new();
            for (i, m) in inner.monitors.iter().enumerate() {
                if let Some(m) = m {
                    fds.push(libc::pollfd {
                        fd: m.fd,
                        events: to_poll_mask(m.events),
                        revents: 0,
                    });
                    ids.push(i);
                }
            }
            (fds, ids)
        };

        let wait = self.next_wait(timeout);
        let timeout_ms = wait.map_or(-1i32, |d| d.as_millis().min(i32::MAX as u128) as i32);

        let nready = if pollfds.is_empty() {
            if let Some(d) = wait {
                std::thread::sleep(d);
            }
            0
        } else {
            // Safety: the vector outlives the call and len is correct
            let r = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if r < 0 {
                let errno = std::io::Error::last_os_error();
                if errno.kind() == std::io::ErrorKind::Interrupted {
                    0
                } else {
                    return Err(set_last_error(Error::IoFailure));
                }
            } else {
                r
            }
        };

        let mut dispatched = false;

        if nready > 0 {
            for (pfd, &slot) in pollfds.iter().zip(ids.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                let got = from_poll_mask(pfd.revents);
                let entry = {
                    let inner = self.inner.borrow();
                    inner
                        .monitors
                        .get(slot)
                        .and_then(|m| m.as_ref())
                        .filter(|m| m.fd == pfd.fd)
                        .map(|m| (m.cb.clone(), m.events))
                };
                if let Some((cb, subscribed)) = entry {
                    // HUP/ERR/NVAL are delivered even when not subscribed
                    let visible = got & (subscribed | IoEvent::Hup | IoEvent::Err | IoEvent::Nval);
                    if visible.is_empty() {
                        continue;
                    }
                    dispatched = true;
                    if !cb(pfd.fd, visible) {
                        self.remove_monitor(MonitorId(slot));
                    }
                }
            }
        }

        // fire due timers
        let now = Instant::now();
        let due: Vec<(usize, TimerCallback)> = {
            let mut inner = self.inner.borrow_mut();
            let mut due = Vec::new();
            for (i, t) in inner.timers.iter_mut().enumerate() {
                if let Some(t) = t {
                    if t.due <= now {
                        t.due = now + t.interval;
                        due.push((i, t.cb.clone()));
                    }
                }
            }
            due
        };
        for (slot, cb) in due {
            dispatched = true;
            if !cb() {
                self.stop_timer(TimerId(slot));
            }
        }

        Ok(dispatched)
    }

    /// Run until `quit` is requested.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            if self.inner.borrow().quit {
                self.inner.borrow_mut().quit = false;
                return Ok(());
            }
            self.run_once(Some(Duration::from_millis(100)))?;
        }
    }

    fn next_wait(&self, timeout: Option<Duration>) -> Option<Duration> {
        let inner = self.inner.borrow();
        let now = Instant::now();
        let timer_wait = inner
            .timers
            .iter()
            .flatten()
            .map(|t| t.due.saturating_duration_since(now))
            .min();
        match (timeout, timer_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // Safety: fds is a valid out-array
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_monitor_fires_on_readable() {
        let rl = RunLoop::current();
        let (r, w) = pipe_pair();

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        let id = rl
            .install_monitor(
                r,
                IoEvent::In.into(),
                Rc::new(move |_, ev| {
                    assert!(ev.contains(IoEvent::In));
                    hits2.set(hits2.get() + 1);
                    true
                }),
            )
            .unwrap();

        // nothing readable yet
        rl.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.get(), 0);

        // Safety: writing one byte into the pipe
        unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
        rl.run_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(hits.get(), 1);

        rl.remove_monitor(id);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_callback_return_false_removes() {
        let rl = RunLoop::current();
        let (r, w) = pipe_pair();
        unsafe { libc::write(w, b"y".as_ptr().cast(), 1) };

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        rl.install_monitor(
            r,
            IoEvent::In.into(),
            Rc::new(move |fd, _| {
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 8) };
                hits2.set(hits2.get() + 1);
                false
            }),
        )
        .unwrap();

        rl.run_once(Some(Duration::from_millis(100))).unwrap();
        unsafe { libc::write(w, b"z".as_ptr().cast(), 1) };
        rl.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.get(), 1, "monitor removed after returning false");

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_timer_fires_and_stops() {
        let rl = RunLoop::current();
        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        rl.set_timer(
            Duration::from_millis(5),
            Rc::new(move || {
                hits2.set(hits2.get() + 1);
                hits2.get() < 3
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.get() < 3 && Instant::now() < deadline {
            rl.run_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(hits.get(), 3);

        // the timer stopped itself; no further hits
        rl.run_once(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(hits.get(), 3);
    }
}
