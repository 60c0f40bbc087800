use crate::blockq::{BlockOutcome, Blockq, BlockqAction, BlockqFlags};
use crate::consts::PAGESIZE;
use crate::errno::{Errno, Sysreturn};
use crate::notify::{Epoll, EventHandler, NotifySet};
use crate::sched::thread::IoCompletion;
use crate::unix::fd::{self, FdOps, OpenFlags, UserBuf};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

pub const INITIAL_PIPE_DATA_SIZE: usize = 100;
pub const PIPE_MIN_CAPACITY: usize = PAGESIZE;
/// See pipe(7).
pub const DEFAULT_PIPE_MAX_SIZE: usize = 16 * PAGESIZE;

const PIPE_READ: usize = 0;
const PIPE_WRITE: usize = 1;

pub struct PipeFile {
    which: usize,
    fd: AtomicI32,
    flags: AtomicU32,
    bq: Blockq,
    ns: NotifySet,
    /// Back-pointer, patched right after the pipe record is placed.
    pipe: AtomicPtr<Pipe>,
}

impl PipeFile {
    fn new(which: usize, bq_name: &'static str) -> PipeFile {
        PipeFile {
            which,
            fd: AtomicI32::new(-1),
            flags: AtomicU32::new(0),
            bq: Blockq::new(bq_name),
            ns: NotifySet::new(),
            pipe: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn pipe(&self) -> &'static Pipe {
        unsafe { &*self.pipe.load(Ordering::Acquire) }
    }

    pub fn is_open(&self) -> bool {
        self.fd.load(Ordering::Acquire) != -1
    }

    fn nonblocking(&self) -> bool {
        OpenFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
            .contains(OpenFlags::O_NONBLOCK)
    }

    pub fn blockq(&'static self) -> &'static Blockq {
        &self.bq
    }

    pub fn notify_set(&self) -> &NotifySet {
        &self.ns
    }
}

struct PipeData {
    data: Vec<u8>,
    /// Consumed prefix; the buffer is reset once fully drained.
    start: usize,
    max_size: usize,
}

impl PipeData {
    fn len(&self) -> usize {
        self.data.len() - self.start
    }
}

pub struct Pipe {
    files: [PipeFile; 2],
    inner: Mutex<PipeData>,
    /// One reference per open endpoint; the record recycles at zero.
    ref_cnt: AtomicU64,
}

static PIPE_CACHE: Mutex<Vec<&'static Pipe>> = Mutex::new(Vec::new());

fn cache_alloc() -> &'static Pipe {
    if let Some(p) = PIPE_CACHE.lock().pop() {
        return p;
    }
    let p = Box::leak(Box::new(Pipe {
        files: [
            PipeFile::new(PIPE_READ, "pipe read"),
            PipeFile::new(PIPE_WRITE, "pipe write"),
        ],
        inner: Mutex::new(PipeData {
            data: Vec::new(),
            start: 0,
            max_size: DEFAULT_PIPE_MAX_SIZE,
        }),
        ref_cnt: AtomicU64::new(0),
    }));
    let ptr = p as *const Pipe as *mut Pipe;
    p.files[PIPE_READ].pipe.store(ptr, Ordering::Release);
    p.files[PIPE_WRITE].pipe.store(ptr, Ordering::Release);
    p
}

impl Pipe {
    pub fn read_end(&self) -> &PipeFile {
        &self.files[PIPE_READ]
    }

    pub fn write_end(&self) -> &PipeFile {
        &self.files[PIPE_WRITE]
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    fn notify_reader(&'static self, events: Epoll) {
        let pf = &self.files[PIPE_READ];
        if pf.is_open() {
            if events.contains(Epoll::EPOLLHUP) {
                pf.bq.flush();
            } else {
                pf.bq.wake_one();
            }
            pf.ns.dispatch(events);
        }
    }

    fn notify_writer(&'static self, events: Epoll) {
        let pf = &self.files[PIPE_WRITE];
        if pf.is_open() {
            if events.contains(Epoll::EPOLLHUP) {
                pf.bq.flush();
            } else {
                pf.bq.wake_one();
            }
            pf.ns.dispatch(events);
        }
    }

    /// Close bookkeeping for one endpoint: mark it closed (the fd slot is
    /// already gone), hang up the peer, flush its waiters, drop one pipe
    /// reference.
    fn dealloc_end(&'static self, which: usize) {
        let pf = &self.files[which];
        pf.fd.store(-1, Ordering::Release);
        if which == PIPE_READ {
            self.notify_writer(Epoll::EPOLLHUP);
        } else {
            let data_events = if self.inner.lock().len() > 0 {
                Epoll::EPOLLIN
            } else {
                Epoll::empty()
            };
            self.notify_reader(data_events | Epoll::EPOLLHUP);
        }
        pf.ns.clear();
        self.release();
    }

    fn release(&'static self) {
        if self.ref_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut d = self.inner.lock();
            d.data = Vec::new();
            d.start = 0;
            d.max_size = DEFAULT_PIPE_MAX_SIZE;
            drop(d);
            PIPE_CACHE.lock().push(self);
        }
    }

    /// Clamp to one page minimum; shrinking below the bytes currently
    /// buffered is refused.
    pub fn set_capacity(&self, capacity: usize) -> Sysreturn {
        let capacity = capacity.max(PIPE_MIN_CAPACITY);
        let mut d = self.inner.lock();
        if capacity < d.len() {
            Errno::Busy.as_sysreturn()
        } else {
            d.max_size = capacity;
            capacity as Sysreturn
        }
    }
}

struct PipeReadAction {
    pf: &'static PipeFile,
    dest: UserBuf,
    completion: Option<IoCompletion>,
}

impl PipeReadAction {
    fn finish(&mut self, rv: Sysreturn) -> BlockOutcome {
        self.completion
            .take()
            .expect("pipe read completion already delivered")
            .complete(rv);
        BlockOutcome::Complete(rv)
    }
}

impl BlockqAction for PipeReadAction {
    fn attempt(&mut self, flags: BlockqFlags) -> BlockOutcome {
        if flags.contains(BlockqFlags::NULLIFY) {
            return self.finish(Errno::RestartSys.as_sysreturn());
        }
        if flags.contains(BlockqFlags::TIMEDOUT) {
            return self.finish(Errno::TimedOut.as_sysreturn());
        }
        let p = self.pf.pipe();
        let mut emptied = false;
        let rv;
        {
            let mut d = p.inner.lock();
            let n = d.len().min(self.dest.len());
            if n == 0 {
                if !p.files[PIPE_WRITE].is_open() {
                    rv = 0; // EOF
                } else if self.pf.nonblocking() {
                    rv = Errno::Again.as_sysreturn();
                } else {
                    return BlockOutcome::Block;
                }
            } else {
                let from = d.start;
                unsafe { self.dest.copy_from(&d.data[from..from + n]) };
                d.start += n;
                // Fully drained: reset the buffer so subsequent growth
                // may reallocate at a smaller size.
                if d.len() == 0 {
                    d.data.clear();
                    d.start = 0;
                    emptied = true;
                }
                rv = n as Sysreturn;
            }
        }
        if emptied {
            self.pf.ns.dispatch(Epoll::empty()); // edge re-arm
        }
        if rv > 0 {
            p.notify_writer(Epoll::EPOLLOUT);
        }
        self.finish(rv)
    }
}

struct PipeWriteAction {
    pf: &'static PipeFile,
    src: UserBuf,
    completion: Option<IoCompletion>,
}

impl PipeWriteAction {
    fn finish(&mut self, rv: Sysreturn) -> BlockOutcome {
        self.completion
            .take()
            .expect("pipe write completion already delivered")
            .complete(rv);
        BlockOutcome::Complete(rv)
    }
}

impl BlockqAction for PipeWriteAction {
    fn attempt(&mut self, flags: BlockqFlags) -> BlockOutcome {
        if flags.contains(BlockqFlags::NULLIFY) {
            return self.finish(Errno::RestartSys.as_sysreturn());
        }
        if flags.contains(BlockqFlags::TIMEDOUT) {
            return self.finish(Errno::TimedOut.as_sysreturn());
        }
        let p = self.pf.pipe();
        let mut filled = false;
        let rv;
        {
            let mut d = p.inner.lock();
            let avail = d.max_size - d.len();
            if !p.files[PIPE_READ].is_open() {
                rv = Errno::Pipe.as_sysreturn();
            } else if avail == 0 {
                if self.pf.nonblocking() {
                    rv = Errno::Again.as_sysreturn();
                } else {
                    return BlockOutcome::Block;
                }
            } else {
                let n = self.src.len().min(avail);
                let src = unsafe { self.src.as_slice() };
                d.data.extend_from_slice(&src[..n]);
                if n == avail {
                    filled = true;
                }
                rv = n as Sysreturn;
            }
        }
        if filled {
            self.pf.ns.dispatch(Epoll::empty()); // edge re-arm
        }
        if rv > 0 {
            p.notify_reader(Epoll::EPOLLIN);
        }
        self.finish(rv)
    }
}

impl FdOps for PipeFile {
    fn read(&'static self, dest: UserBuf, completion: IoCompletion) -> Sysreturn {
        if self.which != PIPE_READ {
            let rv = Errno::Badf.as_sysreturn();
            completion.complete(rv);
            return rv;
        }
        if dest.is_empty() {
            completion.complete(0);
            return 0;
        }
        self.bq.check(Box::new(PipeReadAction {
            pf: self,
            dest,
            completion: Some(completion),
        }))
    }

    fn write(&'static self, src: UserBuf, completion: IoCompletion) -> Sysreturn {
        if self.which != PIPE_WRITE {
            let rv = Errno::Badf.as_sysreturn();
            completion.complete(rv);
            return rv;
        }
        if src.is_empty() {
            completion.complete(0);
            return 0;
        }
        self.bq.check(Box::new(PipeWriteAction {
            pf: self,
            src,
            completion: Some(completion),
        }))
    }

    fn events(&'static self) -> Epoll {
        let p = self.pipe();
        let d = p.inner.lock();
        match self.which {
            PIPE_READ => {
                let mut ev = if d.len() > 0 { Epoll::EPOLLIN } else { Epoll::empty() };
                if !p.files[PIPE_WRITE].is_open() {
                    ev |= Epoll::EPOLLHUP;
                }
                ev
            }
            _ => {
                let mut ev = if d.len() < d.max_size {
                    Epoll::EPOLLOUT
                } else {
                    Epoll::empty()
                };
                if !p.files[PIPE_READ].is_open() {
                    ev |= Epoll::EPOLLHUP;
                }
                ev
            }
        }
    }

    fn close(&'static self) -> Sysreturn {
        self.pipe().dealloc_end(self.which);
        0
    }

    fn set_capacity(&'static self, capacity: usize) -> Sysreturn {
        self.pipe().set_capacity(capacity)
    }

    fn get_capacity(&'static self) -> Sysreturn {
        self.pipe().max_size() as Sysreturn
    }

    fn register_notify(&'static self, mask: Epoll, handler: EventHandler) -> Sysreturn {
        self.ns.register(mask, handler);
        0
    }
}

/// Create a pipe and two fds for it. On fd exhaustion the already
/// initialized endpoints are unwound.
pub fn do_pipe2(flags: OpenFlags) -> Result<(i32, i32), Errno> {
    if flags.contains(OpenFlags::O_DIRECT) {
        log::warn!("pipe: O_DIRECT unsupported");
        return Err(Errno::OpNotSupp);
    }

    let p = cache_alloc();
    {
        let mut d = p.inner.lock();
        d.data = Vec::with_capacity(INITIAL_PIPE_DATA_SIZE);
        d.start = 0;
        d.max_size = DEFAULT_PIPE_MAX_SIZE;
    }
    let end_flags = (flags & OpenFlags::O_NONBLOCK).bits();
    p.files[PIPE_READ].flags.store(end_flags, Ordering::Relaxed);
    p.files[PIPE_WRITE].flags.store(end_flags, Ordering::Relaxed);
    p.ref_cnt.store(2, Ordering::Release);

    let rfd = match fd::allocate_fd(&p.files[PIPE_READ]) {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("pipe: failed to allocate fd");
            p.dealloc_end(PIPE_READ);
            p.dealloc_end(PIPE_WRITE);
            return Err(e);
        }
    };
    p.files[PIPE_READ].fd.store(rfd, Ordering::Release);

    let wfd = match fd::allocate_fd(&p.files[PIPE_WRITE]) {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("pipe: failed to allocate fd");
            fd::remove_fd(rfd);
            p.dealloc_end(PIPE_READ);
            p.dealloc_end(PIPE_WRITE);
            return Err(e);
        }
    };
    p.files[PIPE_WRITE].fd.store(wfd, Ordering::Release);

    Ok((rfd, wfd))
}
