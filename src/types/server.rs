use std::collections::{BTreeMap, VecDeque};
use std::process;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::heap::JobHeap;
use super::job::{Job, JobId, Pri};
use super::states::JobState;
use crate::wire::events::ClientEvent;
use crate::wire::protocol::{Command, JobStats, Response, ServerStats};

/// Identifies one client connection for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Per-connection state held by the core.
#[derive(Debug)]
struct ConnState {
    /// Reply port. Replies to a blocked `reserve` arrive here whenever the
    /// matching step runs, regardless of which connection triggered it.
    tx: mpsc::UnboundedSender<Response>,
    /// Jobs reserved by this connection, soonest deadline first.
    reserved: Vec<(Instant, Job)>,
    /// Has issued at least one `put`.
    producer: bool,
    /// Has issued at least one `reserve`.
    worker: bool,
    /// Number of `reserve`s awaiting a job.
    waiting: u32,
}

#[derive(Debug, Default)]
struct Counters {
    cmd_put: u64,
    cmd_peek: u64,
    cmd_reserve: u64,
    cmd_delete: u64,
    cmd_release: u64,
    cmd_bury: u64,
    cmd_kick: u64,
    cmd_stats: u64,
    job_timeouts: u64,
    total_jobs: u64,
    total_connections: u64,
}

/// The lifecycle engine. Owns every job and all queue state; commands,
/// connection attach/detach, and timer ticks mutate it one at a time.
///
/// Methods are synchronous and take `now` explicitly, so a driving task can
/// serialise access (the single-actor model) and tests can replay any
/// schedule deterministically.
///
/// Each job is owned by exactly one collection at all times: the ready heap,
/// the delay heap, one connection's reservation list, or the graveyard. The
/// job's state field names the collection holding it.
pub struct Server {
    ready_q: JobHeap<(Pri, JobId)>,
    delay_q: JobHeap<(Instant, JobId)>,
    /// Entry budget shared by the ready and delay queues: their combined
    /// size never exceeds it. Inserts that would are refused, and the job
    /// falls back to the graveyard.
    heap_capacity: usize,
    /// Buried jobs in burial order; `kick` takes from the front.
    graveyard: VecDeque<Job>,
    conns: BTreeMap<ConnId, ConnState>,
    /// Connections blocked in `reserve`, head served first. Entries for
    /// closed connections are dropped lazily.
    waiting: VecDeque<ConnId>,
    next_id: JobId,
    /// Ready jobs with priority < 1024, maintained incrementally.
    urgent: u64,
    draining: bool,
    started: Instant,
    max_job_size: u32,
    counters: Counters,
}

impl Server {
    pub fn new(heap_capacity: usize, max_job_size: u32, now: Instant) -> Self {
        Self {
            ready_q: JobHeap::new(),
            delay_q: JobHeap::new(),
            heap_capacity,
            graveyard: VecDeque::new(),
            conns: BTreeMap::new(),
            waiting: VecDeque::new(),
            next_id: JobId::first(),
            urgent: 0,
            draining: false,
            started: now,
            max_job_size,
            counters: Default::default(),
        }
    }

    /// Registers a connection and its reply port.
    pub fn attach(&mut self, conn: ConnId, tx: mpsc::UnboundedSender<Response>) {
        self.counters.total_connections += 1;
        self.conns.insert(
            conn,
            ConnState {
                tx,
                reserved: Vec::new(),
                producer: false,
                worker: false,
                waiting: 0,
            },
        );
    }

    /// Removes a connection. Anything it still held reserved is released
    /// back to the ready queue (buried on overflow), so no job is lost.
    pub fn detach(&mut self, conn: ConnId, now: Instant) {
        let Some(state) = self.conns.remove(&conn) else {
            return;
        };

        self.waiting.retain(|cid| *cid != conn);

        for (_, job) in state.reserved {
            let id = job.id;
            if let Err(job) = self.enqueue_ready(job) {
                debug!(%id, "ready queue full, burying job of closed connection");
                self.bury_job(job);
            }
        }

        self.match_jobs(now);
    }

    /// Enters drain mode: every subsequent `put` is refused. Irreversible
    /// for the life of the process.
    pub fn drain(&mut self) {
        debug!("entering drain mode");
        self.draining = true;
    }

    /// Applies one unit of client input and pushes any replies it produces.
    pub fn dispatch(&mut self, conn: ConnId, evt: ClientEvent, now: Instant) {
        match evt {
            ClientEvent::Put {
                pri,
                delay,
                ttr,
                body,
            } => self.put(conn, pri, delay, ttr, body, now),
            ClientEvent::Command(cmd) => match cmd {
                Command::Reserve => self.reserve(conn, now),
                Command::Delete { id } => self.delete(conn, id),
                Command::Release { id, pri, delay } => {
                    self.release(conn, id, pri, delay, now)
                },
                Command::Bury { id, pri } => self.bury(conn, id, pri),
                Command::Kick { bound } => self.kick(conn, bound, now),
                Command::Peek => self.peek(conn),
                Command::PeekJob { id } => self.peek_job(conn, id),
                Command::Stats => self.stats(conn, now),
                Command::StatsJob { id } => self.stats_job(conn, id, now),
                // the decoder expands put into a body-bearing event
                Command::Put { .. } => {
                    self.reply(conn, Response::InternalError)
                },
            },
        }
    }

    /// The next instant at which [`tick`](Self::tick) has work to do: the
    /// earliest delayed-job deadline or reservation expiry, whichever comes
    /// first.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delay_q.peek_key().map(|(until, _)| until);
        let reserved = self
            .conns
            .values()
            .filter_map(|c| c.reserved.first().map(|(deadline, _)| *deadline))
            .min();

        [delayed, reserved].into_iter().flatten().min()
    }

    /// Runs the time-driven transitions: delayed jobs whose deadline has
    /// passed become ready, and expired reservations return their jobs to
    /// the ready queue (buried on overflow, with the timeout counted either
    /// way).
    pub fn tick(&mut self, now: Instant) {
        while let Some((until, _)) = self.delay_q.peek_key() {
            if until > now {
                break;
            }
            // Panic safety: peek_key returned a value, so take succeeds.
            let job = self.delay_q.take().unwrap();
            let id = job.id;
            if let Err(job) = self.enqueue_ready(job) {
                debug!(%id, "ready queue full, burying expired delayed job");
                self.bury_job(job);
            }
            self.match_jobs(now);
        }

        // A connection can have several expired reservations in one tick.
        let holders: Vec<ConnId> = self.conns.keys().copied().collect();
        for cid in holders {
            loop {
                let expired = self.conns.get(&cid).is_some_and(|c| {
                    matches!(c.reserved.first(), Some((at, _)) if *at <= now)
                });
                if !expired {
                    break;
                }

                // Panic safety: the connection and entry were just observed.
                let (_, mut job) =
                    self.conns.get_mut(&cid).unwrap().reserved.remove(0);
                job.timeouts += 1;
                self.counters.job_timeouts += 1;

                let id = job.id;
                debug!(%id, conn = cid.0, "reservation expired");
                if let Err(job) = self.enqueue_ready(job) {
                    self.bury_job(job);
                }
            }
        }

        self.match_jobs(now);
    }

    // Command handlers.

    fn put(
        &mut self,
        conn: ConnId,
        pri: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
        now: Instant,
    ) {
        self.counters.cmd_put += 1;
        if let Some(c) = self.conns.get_mut(&conn) {
            c.producer = true;
        }

        if self.draining {
            self.reply(conn, Response::Draining);
            return;
        }

        let id = self.alloc_id();
        self.counters.total_jobs += 1;
        let job = Job::new(id, Pri::new(pri), delay, ttr, body, now);

        let enqueued = if delay > 0 {
            let until = now + Duration::from_secs(delay as u64);
            self.enqueue_delayed(job, until)
        } else {
            self.enqueue_ready(job)
        };

        let resp = match enqueued {
            Ok(()) => Response::Inserted { id: id.get() },
            Err(job) => {
                debug!(%id, "queue full, burying incoming job");
                self.bury_job(job);
                Response::BuriedId { id: id.get() }
            },
        };

        self.reply(conn, resp);
        self.match_jobs(now);
    }

    fn reserve(&mut self, conn: ConnId, now: Instant) {
        self.counters.cmd_reserve += 1;
        if let Some(c) = self.conns.get_mut(&conn) {
            c.worker = true;
            c.waiting += 1;
            self.waiting.push_back(conn);
        }

        self.match_jobs(now);
    }

    fn delete(&mut self, conn: ConnId, raw_id: u64) {
        self.counters.cmd_delete += 1;

        let Some(id) = JobId::new(raw_id) else {
            self.reply(conn, Response::NotFound);
            return;
        };

        // Resolution order: reserved by this connection, then buried, then
        // reserved by anyone (administrative deletion).
        if self.take_reserved(conn, id).is_some() {
            self.reply(conn, Response::Deleted);
            return;
        }

        if let Some(at) = self.graveyard.iter().position(|j| j.id == id) {
            self.graveyard.remove(at);
            self.reply(conn, Response::Deleted);
            return;
        }

        let holders: Vec<ConnId> = self.conns.keys().copied().collect();
        for cid in holders {
            if self.take_reserved(cid, id).is_some() {
                self.reply(conn, Response::Deleted);
                return;
            }
        }

        self.reply(conn, Response::NotFound);
    }

    fn release(
        &mut self,
        conn: ConnId,
        raw_id: u64,
        pri: u32,
        delay: u32,
        now: Instant,
    ) {
        self.counters.cmd_release += 1;

        let taken =
            JobId::new(raw_id).and_then(|id| self.take_reserved(conn, id));
        let Some(mut job) = taken else {
            self.reply(conn, Response::NotFound);
            return;
        };

        job.pri = Pri::new(pri);
        job.delay = delay;
        job.releases += 1;

        let enqueued = if delay > 0 {
            let until = now + Duration::from_secs(delay as u64);
            self.enqueue_delayed(job, until)
        } else {
            self.enqueue_ready(job)
        };

        let resp = match enqueued {
            Ok(()) => Response::Released,
            Err(job) => {
                self.bury_job(job);
                Response::Buried
            },
        };

        self.reply(conn, resp);
        self.match_jobs(now);
    }

    fn bury(&mut self, conn: ConnId, raw_id: u64, pri: u32) {
        self.counters.cmd_bury += 1;

        let taken =
            JobId::new(raw_id).and_then(|id| self.take_reserved(conn, id));
        match taken {
            Some(mut job) => {
                job.pri = Pri::new(pri);
                job.buries += 1;
                self.bury_job(job);
                self.reply(conn, Response::Buried);
            },
            None => self.reply(conn, Response::NotFound),
        }
    }

    fn kick(&mut self, conn: ConnId, bound: u64, now: Instant) {
        self.counters.cmd_kick += 1;

        let mut moved = 0;
        if !self.graveyard.is_empty() {
            while moved < bound {
                let Some(job) = self.graveyard.pop_front() else {
                    break;
                };
                match self.kick_into_ready(job) {
                    Ok(()) => moved += 1,
                    Err(mut job) => {
                        // No room; put it back where it was.
                        job.state = JobState::Buried;
                        self.graveyard.push_front(job);
                        break;
                    },
                }
            }
        } else {
            // With nothing buried, kick promotes delayed jobs early,
            // next-to-fire first.
            while moved < bound {
                let Some(job) = self.delay_q.take() else {
                    break;
                };
                match self.kick_into_ready(job) {
                    Ok(()) => moved += 1,
                    Err(job) => {
                        self.bury_job(job);
                        break;
                    },
                }
            }
        }

        self.reply(conn, Response::Kicked { count: moved });
        self.match_jobs(now);
    }

    fn peek(&mut self, conn: ConnId) {
        self.counters.cmd_peek += 1;

        // Buried jobs take precedence over delayed ones.
        let found = self.graveyard.front().or_else(|| self.delay_q.peek());
        let resp = match found {
            Some(job) => Response::Found {
                id: job.id.get(),
                pri: job.pri.get(),
                body: job.body.clone(),
            },
            None => Response::NotFound,
        };

        self.reply(conn, resp);
    }

    fn peek_job(&mut self, conn: ConnId, raw_id: u64) {
        self.counters.cmd_peek += 1;

        let found = JobId::new(raw_id).and_then(|id| self.find_job(id));
        let resp = match found {
            Some(job) => Response::Found {
                id: job.id.get(),
                pri: job.pri.get(),
                body: job.body.clone(),
            },
            None => Response::NotFound,
        };

        self.reply(conn, resp);
    }

    fn stats(&mut self, conn: ConnId, now: Instant) {
        self.counters.cmd_stats += 1;

        let (rusage_utime, rusage_stime) = cpu_times();
        let data = ServerStats {
            current_jobs_urgent: self.urgent,
            current_jobs_ready: self.ready_q.used() as u64,
            current_jobs_reserved: self
                .conns
                .values()
                .map(|c| c.reserved.len() as u64)
                .sum(),
            current_jobs_delayed: self.delay_q.used() as u64,
            current_jobs_buried: self.graveyard.len() as u64,

            cmd_put: self.counters.cmd_put,
            cmd_peek: self.counters.cmd_peek,
            cmd_reserve: self.counters.cmd_reserve,
            cmd_delete: self.counters.cmd_delete,
            cmd_release: self.counters.cmd_release,
            cmd_bury: self.counters.cmd_bury,
            cmd_kick: self.counters.cmd_kick,
            cmd_stats: self.counters.cmd_stats,

            job_timeouts: self.counters.job_timeouts,
            total_jobs: self.counters.total_jobs,
            max_job_size: self.max_job_size as u64,
            heap_size: self.heap_capacity as u64,

            current_connections: self.conns.len() as u64,
            current_producers: self
                .conns
                .values()
                .filter(|c| c.producer)
                .count() as u64,
            current_workers: self.conns.values().filter(|c| c.worker).count()
                as u64,
            current_waiting: self
                .conns
                .values()
                .filter(|c| c.waiting > 0)
                .count() as u64,
            total_connections: self.counters.total_connections,

            pid: process::id(),
            version: env!("CARGO_PKG_VERSION"),
            rusage_utime,
            rusage_stime,
            uptime: now.saturating_duration_since(self.started).as_secs(),

            draining: self.draining,
        };

        self.reply(conn, Response::OkStats { data });
    }

    fn stats_job(&mut self, conn: ConnId, raw_id: u64, now: Instant) {
        self.counters.cmd_stats += 1;

        let found = JobId::new(raw_id).and_then(|id| self.find_job(id));
        let resp = match found {
            Some(job) => Response::OkStatsJob {
                data: JobStats {
                    id: job.id.get(),
                    state: job.state,
                    age: job.age_secs(now),
                    delay: job.delay,
                    ttr: job.ttr,
                    time_left: job.time_left_secs(now),
                    timeouts: job.timeouts,
                    releases: job.releases,
                    buries: job.buries,
                    kicks: job.kicks,
                },
            },
            None => Response::NotFound,
        };

        self.reply(conn, resp);
    }

    // The matching step and its helpers.

    /// While the ready queue and the waiting queue are both non-empty, hand
    /// the minimum ready job to the head waiting worker, starting its TTR
    /// clock.
    fn match_jobs(&mut self, now: Instant) {
        while self.ready_q.used() > 0 {
            let Some(cid) = self.pop_waiting() else {
                return;
            };

            // Panic safety: used() > 0, so take returns a job.
            let mut job = self.ready_q.take().unwrap();
            if job.pri.is_urgent() {
                self.urgent -= 1;
            }

            let deadline = now + job.ttr_duration();
            job.state = JobState::Reserved { deadline };
            let resp = Response::Reserved {
                id: job.id.get(),
                pri: job.pri.get(),
                body: job.body.clone(),
            };

            // Panic safety: pop_waiting only returns attached connections.
            let conn = self.conns.get_mut(&cid).unwrap();
            let at = conn.reserved.partition_point(|(d, _)| *d <= deadline);
            conn.reserved.insert(at, (deadline, job));

            // A send failure means the connection is mid-close; detach will
            // reclaim the reservation.
            let _ = conn.tx.send(resp);
        }
    }

    /// Pops the first waiting queue entry that still names a live, waiting
    /// connection.
    fn pop_waiting(&mut self) -> Option<ConnId> {
        while let Some(cid) = self.waiting.pop_front() {
            if let Some(conn) = self.conns.get_mut(&cid) {
                if conn.waiting > 0 {
                    conn.waiting -= 1;
                    return Some(cid);
                }
            }
        }

        None
    }

    fn alloc_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id = id.succ();
        id
    }

    /// Combined size of the two heaps, checked against the shared budget.
    fn heap_used(&self) -> usize {
        self.ready_q.used() + self.delay_q.used()
    }

    fn enqueue_ready(&mut self, mut job: Job) -> Result<(), Job> {
        if self.heap_used() >= self.heap_capacity {
            return Err(job);
        }

        job.state = JobState::Ready;
        if job.pri.is_urgent() {
            self.urgent += 1;
        }
        self.ready_q.give((job.pri, job.id), job);

        Ok(())
    }

    fn enqueue_delayed(&mut self, mut job: Job, until: Instant) -> Result<(), Job> {
        if self.heap_used() >= self.heap_capacity {
            return Err(job);
        }

        job.state = JobState::Delayed { until };
        self.delay_q.give((until, job.id), job);

        Ok(())
    }

    fn bury_job(&mut self, mut job: Job) {
        job.state = JobState::Buried;
        self.graveyard.push_back(job);
    }

    /// Moves a job to the ready queue on behalf of `kick`, counting the kick
    /// only if it fits.
    fn kick_into_ready(&mut self, mut job: Job) -> Result<(), Job> {
        job.kicks += 1;
        self.enqueue_ready(job).map_err(|mut job| {
            job.kicks -= 1;
            job
        })
    }

    /// Removes a job from `conn`'s reservation list by ID.
    fn take_reserved(&mut self, conn: ConnId, id: JobId) -> Option<Job> {
        let c = self.conns.get_mut(&conn)?;
        let at = c.reserved.iter().position(|(_, j)| j.id == id)?;
        Some(c.reserved.remove(at).1)
    }

    /// Finds a job in any pool, for the peek and stats paths.
    fn find_job(&self, id: JobId) -> Option<&Job> {
        self.ready_q
            .find(id)
            .or_else(|| self.delay_q.find(id))
            .or_else(|| self.graveyard.iter().find(|j| j.id == id))
            .or_else(|| {
                self.conns.values().find_map(|c| {
                    c.reserved.iter().map(|(_, j)| j).find(|j| j.id == id)
                })
            })
    }

    fn reply(&self, conn: ConnId, resp: Response) {
        if let Some(c) = self.conns.get(&conn) {
            let _ = c.tx.send(resp);
        }
    }
}

#[cfg(unix)]
fn cpu_times() -> (f64, f64) {
    use std::mem::MaybeUninit;

    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage writes a complete rusage through a valid pointer.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return (0.0, 0.0);
    }
    let usage = unsafe { usage.assume_init() };

    let secs = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6;
    (secs(usage.ru_utime), secs(usage.ru_stime))
}

#[cfg(not(unix))]
fn cpu_times() -> (f64, f64) {
    (0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{self, Duration, Instant};

    use super::*;

    struct TestServer {
        server: Server,
        rxs: Vec<(ConnId, UnboundedReceiver<Response>)>,
        next_conn: u64,
    }

    impl TestServer {
        fn with_capacity(heap_capacity: usize) -> Self {
            Self {
                server: Server::new(heap_capacity, 65535, Instant::now()),
                rxs: Vec::new(),
                next_conn: 0,
            }
        }

        fn new() -> Self {
            Self::with_capacity(1024)
        }

        fn connect(&mut self) -> ConnId {
            let id = ConnId::new(self.next_conn);
            self.next_conn += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            self.server.attach(id, tx);
            self.rxs.push((id, rx));

            id
        }

        fn close(&mut self, conn: ConnId) {
            self.server.detach(conn, Instant::now());
        }

        fn put(&mut self, conn: ConnId, pri: u32, delay: u32, ttr: u32, body: &'static [u8]) {
            self.server.dispatch(
                conn,
                ClientEvent::Put {
                    pri,
                    delay,
                    ttr,
                    body: Bytes::from_static(body),
                },
                Instant::now(),
            );
        }

        fn cmd(&mut self, conn: ConnId, cmd: Command) {
            self.server.dispatch(
                conn,
                ClientEvent::Command(cmd),
                Instant::now(),
            );
        }

        fn tick(&mut self) {
            self.server.tick(Instant::now());
        }

        fn rx(&mut self, conn: ConnId) -> &mut UnboundedReceiver<Response> {
            &mut self
                .rxs
                .iter_mut()
                .find(|(id, _)| *id == conn)
                .expect("unknown connection")
                .1
        }

        fn recv(&mut self, conn: ConnId) -> Response {
            self.rx(conn).try_recv().expect("expected a pending reply")
        }

        fn assert_idle(&mut self, conn: ConnId) {
            assert!(matches!(
                self.rx(conn).try_recv(),
                Err(TryRecvError::Empty),
            ));
        }

        fn server_stats(&mut self, conn: ConnId) -> ServerStats {
            self.cmd(conn, Command::Stats);
            match self.recv(conn) {
                Response::OkStats { data } => data,
                other => panic!("expected OkStats, got {other:?}"),
            }
        }

        fn job_stats(&mut self, conn: ConnId, id: u64) -> JobStats {
            self.cmd(conn, Command::StatsJob { id });
            match self.recv(conn) {
                Response::OkStatsJob { data } => data,
                other => panic!("expected OkStatsJob, got {other:?}"),
            }
        }
    }

    fn reserved(id: u64, pri: u32, body: &'static [u8]) -> Response {
        Response::Reserved {
            id,
            pri,
            body: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn produce_then_consume() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"hello");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"hello"));

        t.cmd(b, Command::Delete { id: 1 });
        assert_eq!(t.recv(b), Response::Deleted);

        t.cmd(b, Command::PeekJob { id: 1 });
        assert_eq!(t.recv(b), Response::NotFound);
    }

    #[tokio::test]
    async fn priority_order_with_fifo_ties() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 10, 0, 60, b"a");
        t.put(a, 1, 0, 60, b"b");
        t.put(a, 10, 0, 60, b"c");
        for id in 1..=3 {
            assert_eq!(t.recv(a), Response::Inserted { id });
        }

        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(2, 1, b"b"));
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 10, b"a"));
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(3, 10, b"c"));
    }

    #[tokio::test]
    async fn waiting_workers_are_served_fifo() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();
        let c = t.connect();

        t.cmd(b, Command::Reserve);
        t.cmd(c, Command::Reserve);
        t.assert_idle(b);
        t.assert_idle(c);

        t.put(a, 0, 0, 60, b"one");
        assert_eq!(t.recv(b), reserved(1, 0, b"one"));
        t.assert_idle(c);

        t.put(a, 0, 0, 60, b"two");
        assert_eq!(t.recv(c), reserved(2, 0, b"two"));
    }

    #[tokio::test]
    async fn kick_promotes_delayed_job_to_waiting_worker() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 60, 30, b"x");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        t.cmd(b, Command::Reserve);
        t.assert_idle(b);

        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 1 });
        assert_eq!(t.recv(b), reserved(1, 0, b"x"));

        let js = t.job_stats(a, 1);
        assert_eq!(js.kicks, 1);
        assert_eq!(js.state.name(), "reserved");
    }

    #[tokio::test(start_paused = true)]
    async fn ttr_expiry_requeues_the_job() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();
        let c = t.connect();

        t.put(a, 0, 0, 1, b"y");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"y"));

        let wakeup = t.server.next_wakeup().expect("a reservation is live");
        time::advance(Duration::from_secs(2)).await;
        assert!(wakeup <= Instant::now());
        t.tick();

        // b holds nothing any more; the job went back to ready
        let js = t.job_stats(a, 1);
        assert_eq!(js.state.name(), "ready");
        assert_eq!(js.timeouts, 1);

        t.cmd(c, Command::Reserve);
        assert_eq!(t.recv(c), reserved(1, 0, b"y"));
        t.assert_idle(b);

        assert_eq!(t.server_stats(a).job_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_becomes_ready_at_deadline() {
        let mut t = TestServer::new();
        let a = t.connect();

        t.put(a, 0, 5, 60, b"later");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        assert_eq!(t.job_stats(a, 1).state.name(), "delayed");

        // Nothing happens before the deadline.
        time::advance(Duration::from_secs(3)).await;
        t.tick();
        assert_eq!(t.job_stats(a, 1).state.name(), "delayed");

        time::advance(Duration::from_secs(2)).await;
        t.tick();
        assert_eq!(t.job_stats(a, 1).state.name(), "ready");
        assert!(t.server.next_wakeup().is_none());
    }

    #[tokio::test]
    async fn bury_peek_kick_cycle() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"y");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"y"));

        t.cmd(b, Command::Bury { id: 1, pri: 5 });
        assert_eq!(t.recv(b), Response::Buried);
        assert_eq!(t.job_stats(a, 1).buries, 1);

        t.cmd(a, Command::Peek);
        assert_eq!(
            t.recv(a),
            Response::Found {
                id: 1,
                pri: 5,
                body: Bytes::from_static(b"y"),
            },
        );

        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 1 });

        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 5, b"y"));
    }

    #[tokio::test]
    async fn drain_mode_refuses_only_puts() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"z");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        t.server.drain();

        t.put(a, 0, 0, 60, b"z");
        assert_eq!(t.recv(a), Response::Draining);

        // Existing jobs still drain out.
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"z"));
        t.cmd(b, Command::Delete { id: 1 });
        assert_eq!(t.recv(b), Response::Deleted);

        assert!(t.server_stats(a).draining);
    }

    #[tokio::test]
    async fn closing_a_worker_releases_its_reservations() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();
        let c = t.connect();

        t.put(a, 0, 0, 60, b"held");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"held"));

        t.close(b);

        // The job survived and is ready again, not destroyed.
        assert_eq!(t.job_stats(a, 1).state.name(), "ready");
        t.cmd(c, Command::Reserve);
        assert_eq!(t.recv(c), reserved(1, 0, b"held"));
    }

    #[tokio::test]
    async fn closing_a_waiting_worker_forgets_it() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();
        let c = t.connect();

        t.cmd(b, Command::Reserve);
        t.cmd(c, Command::Reserve);
        t.close(b);

        // b was at the head of the waiting queue; c gets the job.
        t.put(a, 0, 0, 60, b"x");
        assert_eq!(t.recv(c), reserved(1, 0, b"x"));
    }

    #[tokio::test]
    async fn full_ready_queue_buries_puts() {
        let mut t = TestServer::with_capacity(2);
        let a = t.connect();

        t.put(a, 0, 0, 60, b"1");
        t.put(a, 0, 0, 60, b"2");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });

        t.put(a, 0, 0, 60, b"3");
        assert_eq!(t.recv(a), Response::BuriedId { id: 3 });
        assert_eq!(t.job_stats(a, 3).state.name(), "buried");

        // Kicking it back fails while the ready queue is still full, and the
        // job is not counted or double-counted.
        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 0 });
        assert_eq!(t.job_stats(a, 3).state.name(), "buried");
        assert_eq!(t.job_stats(a, 3).kicks, 0);

        // Once a slot frees up the kick succeeds.
        t.cmd(a, Command::Reserve);
        assert_eq!(t.recv(a), reserved(1, 0, b"1"));
        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 1 });
        assert_eq!(t.job_stats(a, 3).state.name(), "ready");
    }

    #[tokio::test]
    async fn heaps_share_one_capacity_budget() {
        let mut t = TestServer::with_capacity(2);
        let a = t.connect();

        // Two delayed jobs exhaust the budget shared with the ready queue.
        t.put(a, 0, 60, 60, b"d1");
        t.put(a, 0, 60, 60, b"d2");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });

        t.put(a, 0, 0, 60, b"r");
        assert_eq!(t.recv(a), Response::BuriedId { id: 3 });
        assert_eq!(t.job_stats(a, 3).state.name(), "buried");

        // The buried job cannot be kicked back in while the budget is spent.
        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 0 });
        t.cmd(a, Command::Delete { id: 3 });
        assert_eq!(t.recv(a), Response::Deleted);

        // A delayed put is refused by the same budget.
        t.put(a, 0, 60, 60, b"d3");
        assert_eq!(t.recv(a), Response::BuriedId { id: 4 });
        t.cmd(a, Command::Delete { id: 4 });
        assert_eq!(t.recv(a), Response::Deleted);

        // Kicking a delayed job only moves it between the queues, so it
        // succeeds even with the budget fully spent.
        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 1 });
        let s = t.server_stats(a);
        assert_eq!(s.current_jobs_ready, 1);
        assert_eq!(s.current_jobs_delayed, 1);
    }

    #[tokio::test]
    async fn kick_bound_exceeding_graveyard_moves_what_exists() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        for body in [b"1", b"2", b"3"] {
            t.put(a, 0, 0, 60, body);
            t.recv(a);
            t.cmd(b, Command::Reserve);
            t.recv(b);
        }
        for id in 1..=3 {
            t.cmd(b, Command::Bury { id, pri: 0 });
            assert_eq!(t.recv(b), Response::Buried);
        }

        t.cmd(a, Command::Kick { bound: 100 });
        assert_eq!(t.recv(a), Response::Kicked { count: 3 });

        // Buried jobs come back in burial order.
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"1"));
    }

    #[tokio::test]
    async fn kick_takes_delayed_jobs_by_earliest_deadline() {
        let mut t = TestServer::new();
        let a = t.connect();

        t.put(a, 0, 100, 60, b"late");
        t.put(a, 0, 50, 60, b"soon");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });

        t.cmd(a, Command::Kick { bound: 1 });
        assert_eq!(t.recv(a), Response::Kicked { count: 1 });

        // The next-to-fire job (id 2) moved, not the older id 1.
        assert_eq!(t.job_stats(a, 2).state.name(), "ready");
        assert_eq!(t.job_stats(a, 1).state.name(), "delayed");
    }

    #[tokio::test(start_paused = true)]
    async fn release_with_delay_then_redelivery() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"w");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"w"));

        t.cmd(b, Command::Release { id: 1, pri: 500, delay: 10 });
        assert_eq!(t.recv(b), Response::Released);

        let js = t.job_stats(a, 1);
        assert_eq!(js.state.name(), "delayed");
        assert_eq!(js.releases, 1);
        assert_eq!(js.delay, 10);

        time::advance(Duration::from_secs(11)).await;
        t.tick();

        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 500, b"w"));
    }

    #[tokio::test]
    async fn release_of_unreserved_job_is_not_found() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"x");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        // Ready, but not reserved by b.
        t.cmd(b, Command::Release { id: 1, pri: 0, delay: 0 });
        assert_eq!(t.recv(b), Response::NotFound);
        t.cmd(b, Command::Bury { id: 1, pri: 0 });
        assert_eq!(t.recv(b), Response::NotFound);

        // Reserved by a, so still not releasable by b.
        t.cmd(a, Command::Reserve);
        assert_eq!(t.recv(a), reserved(1, 0, b"x"));
        t.cmd(b, Command::Release { id: 1, pri: 0, delay: 0 });
        assert_eq!(t.recv(b), Response::NotFound);
    }

    #[tokio::test]
    async fn delete_resolution_order() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        // A ready job is not deletable.
        t.put(a, 0, 0, 60, b"r");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        t.cmd(a, Command::Delete { id: 1 });
        assert_eq!(t.recv(a), Response::NotFound);

        // A job reserved by someone else is (administrative deletion).
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"r"));
        t.cmd(a, Command::Delete { id: 1 });
        assert_eq!(t.recv(a), Response::Deleted);

        // A buried job is deletable by anyone.
        t.put(a, 0, 0, 60, b"g");
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(2, 0, b"g"));
        t.cmd(b, Command::Bury { id: 2, pri: 0 });
        assert_eq!(t.recv(b), Response::Buried);
        t.cmd(a, Command::Delete { id: 2 });
        assert_eq!(t.recv(a), Response::Deleted);

        t.cmd(a, Command::Delete { id: 0 });
        assert_eq!(t.recv(a), Response::NotFound);
    }

    #[tokio::test]
    async fn peek_prefers_buried_over_delayed() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 60, 60, b"delayed");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });

        t.put(a, 0, 0, 60, b"buried");
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });
        t.cmd(b, Command::Reserve);
        t.recv(b);
        t.cmd(b, Command::Bury { id: 2, pri: 9 });
        assert_eq!(t.recv(b), Response::Buried);

        t.cmd(a, Command::Peek);
        assert_eq!(
            t.recv(a),
            Response::Found {
                id: 2,
                pri: 9,
                body: Bytes::from_static(b"buried"),
            },
        );

        t.cmd(a, Command::Delete { id: 2 });
        assert_eq!(t.recv(a), Response::Deleted);

        // With the graveyard empty, the next-to-fire delayed job shows.
        t.cmd(a, Command::Peek);
        assert_eq!(
            t.recv(a),
            Response::Found {
                id: 1,
                pri: 0,
                body: Bytes::from_static(b"delayed"),
            },
        );
    }

    #[tokio::test]
    async fn peek_by_id_searches_every_pool() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 1, 0, 60, b"ready");
        t.put(a, 2, 60, 60, b"delayed");
        t.put(a, 3, 0, 60, b"reserved");
        for id in 1..=3 {
            assert_eq!(t.recv(a), Response::Inserted { id });
        }
        // The reserve matched job 1, the highest-priority ready job.
        t.cmd(b, Command::Reserve);
        t.recv(b);

        t.cmd(a, Command::PeekJob { id: 2 });
        assert_eq!(
            t.recv(a),
            Response::Found {
                id: 2,
                pri: 2,
                body: Bytes::from_static(b"delayed"),
            },
        );
        t.cmd(a, Command::PeekJob { id: 1 });
        assert_eq!(
            t.recv(a),
            Response::Found {
                id: 1,
                pri: 1,
                body: Bytes::from_static(b"ready"),
            },
        );
        t.cmd(a, Command::PeekJob { id: 4 });
        assert_eq!(t.recv(a), Response::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_reservations_expire_independently() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 10, b"slow");
        t.put(a, 0, 0, 1, b"fast");
        assert_eq!(t.recv(a), Response::Inserted { id: 1 });
        assert_eq!(t.recv(a), Response::Inserted { id: 2 });

        // b pipelines two reserves and holds both jobs at once.
        t.cmd(b, Command::Reserve);
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"slow"));
        assert_eq!(t.recv(b), reserved(2, 0, b"fast"));
        assert_eq!(t.server_stats(a).current_jobs_reserved, 2);

        time::advance(Duration::from_secs(2)).await;
        t.tick();

        // Only the short-TTR reservation expired.
        assert_eq!(t.job_stats(a, 2).state.name(), "ready");
        assert_eq!(t.job_stats(a, 1).state.name(), "reserved");
        assert_eq!(t.server_stats(a).current_jobs_reserved, 1);
    }

    #[tokio::test]
    async fn stats_track_counts_and_roles() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        t.put(a, 0, 0, 60, b"urgent");
        t.put(a, 2000, 0, 60, b"plain");
        t.put(a, 0, 30, 60, b"later");
        for id in 1..=3 {
            assert_eq!(t.recv(a), Response::Inserted { id });
        }

        let s = t.server_stats(a);
        assert_eq!(s.current_jobs_ready, 2);
        assert_eq!(s.current_jobs_urgent, 1);
        assert_eq!(s.current_jobs_delayed, 1);
        assert_eq!(s.total_jobs, 3);
        assert_eq!(s.cmd_put, 3);
        assert_eq!(s.cmd_stats, 1);
        assert_eq!(s.current_connections, 2);
        assert_eq!(s.current_producers, 1);
        assert_eq!(s.current_workers, 0);
        assert_eq!(s.total_connections, 2);

        // Reserving the urgent job drops the urgent count.
        t.cmd(b, Command::Reserve);
        assert_eq!(t.recv(b), reserved(1, 0, b"urgent"));
        let s = t.server_stats(a);
        assert_eq!(s.current_jobs_urgent, 0);
        assert_eq!(s.current_jobs_ready, 1);
        assert_eq!(s.current_jobs_reserved, 1);
        assert_eq!(s.current_workers, 1);

        // A waiting worker shows up as such.
        t.cmd(b, Command::Reserve);
        t.cmd(b, Command::Reserve);
        let s = t.server_stats(a);
        assert_eq!(s.current_waiting, 1);
        assert_eq!(s.cmd_reserve, 3);
    }

    #[tokio::test]
    async fn job_counts_balance() {
        let mut t = TestServer::new();
        let a = t.connect();
        let b = t.connect();

        for body in [b"1", b"2", b"3", b"4"] {
            t.put(a, 0, 0, 60, body);
            t.recv(a);
        }
        t.put(a, 0, 60, 60, b"5");
        t.recv(a);

        t.cmd(b, Command::Reserve);
        t.recv(b);
        t.cmd(b, Command::Reserve);
        t.recv(b);
        t.cmd(b, Command::Bury { id: 2, pri: 0 });
        t.recv(b);
        t.cmd(b, Command::Delete { id: 1 });
        assert_eq!(t.recv(b), Response::Deleted);

        let s = t.server_stats(a);
        let live = s.current_jobs_ready
            + s.current_jobs_reserved
            + s.current_jobs_delayed
            + s.current_jobs_buried;
        // five created, one deleted
        assert_eq!(live, 4);
        assert_eq!(s.current_jobs_buried, 1);
    }
}
