use bytes::Bytes;
use serde::Serialize;

use crate::types::states::JobState;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Submits a job. The command line is followed by `n_bytes` of body and
    /// a trailing CRLF; the decoder assembles the body and emits a
    /// body-bearing event in place of this variant.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job, blocking indefinitely until one is matched to this
    /// connection (or the connection closes). A client that pipelines
    /// several reserves holds several reservations at once.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// Destroys a job reserved by this client, or a buried job, or (as an
    /// administrative override) a job reserved by any client, in that
    /// resolution order. Returns `DELETED` or `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Returns a job reserved by this client to the ready queue (or the
    /// delay queue if `delay` is non-zero), updating its priority. Returns
    /// `RELEASED`, `NOT_FOUND`, or `BURIED` if the queue was full.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Sets a job reserved by this client aside on the graveyard with a new
    /// priority. Returns `BURIED` or `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Promotes up to `bound` buried jobs to ready, in burial order. Only if
    /// no buried jobs exist, promotes delayed jobs instead, earliest
    /// deadline first. Returns `KICKED <count>` with the number moved.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u64 },
    /// Returns a copy of the next buried job or, if none, the next-to-fire
    /// delayed job. Response is `FOUND <id> <pri> <bytes>` with the body, or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `peek`
    Peek,
    /// Returns a copy of the job with this ID regardless of its state.
    ///
    /// On the wire: `peek <id>`
    PeekJob { id: u64 },
    /// Reports server-wide counts and totals as a YAML body inside an
    /// `OK <bytes>` response.
    ///
    /// On the wire: `stats`
    Stats,
    /// Reports one job's state, age, timings, and lifecycle counters as a
    /// YAML body inside an `OK <bytes>` response.
    ///
    /// On the wire: `stats <id>`
    StatsJob { id: u64 },
}

/// All possible replies to a client.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// A job allocation failed. Can be sent in response to any command.
    ///
    /// On the wire: `SERVER_ERROR 0 out of memory`.
    OutOfMemory,
    /// Indicates a server bug. The connection is closed after sending.
    ///
    /// On the wire: `SERVER_ERROR 1 internal error`.
    InternalError,
    /// In response to a `put`, indicates the server is draining and not
    /// accepting new jobs.
    ///
    /// On the wire: `SERVER_ERROR 2 draining`.
    Draining,
    /// The client sent a command line the parser could not handle: overlong,
    /// non-numeric fields, or wrong arity. The connection is closed after
    /// sending, as the stream may be out of sync.
    ///
    /// On the wire: `CLIENT_ERROR 0 bad command line format`.
    BadFormat,
    /// The client sent a well-formed line with an unrecognised command name.
    /// The connection is closed after sending.
    ///
    /// On the wire: `CLIENT_ERROR 1 unknown command`.
    UnknownCommand,
    /// The job body of a `put` was not terminated by CRLF. The connection is
    /// closed after sending.
    ///
    /// On the wire: `CLIENT_ERROR 2 expected CR-LF after job body`.
    ExpectedCrlf,
    /// The declared body size of a `put` exceeded the maximum job size. The
    /// connection is closed after sending.
    ///
    /// On the wire: `CLIENT_ERROR 3 job too big`.
    JobTooBig,
    /// In response to a `put`, a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, the job could not be enqueued for capacity
    /// reasons and was buried instead.
    ///
    /// On the wire: `BURIED <id>`.
    BuriedId { id: u64 },
    /// In response to a `bury`, indicates success. In response to a
    /// `release`, indicates the queue was full and the job was buried.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// In response to a `delete`, the job was destroyed.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release`, the job went back to the ready or delay
    /// queue.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// The job named by the command is unknown or does not satisfy the
    /// command's precondition (e.g. not reserved by this client).
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `kick`, the number of jobs actually moved to ready.
    ///
    /// On the wire: `KICKED <count>`.
    Kicked { count: u64 },
    /// A job was matched to this connection's `reserve`. Carries the body.
    ///
    /// On the wire: `RESERVED <id> <pri> <n_bytes>` plus body.
    Reserved { id: u64, pri: u32, body: Bytes },
    /// In response to a `peek`, a copy of the found job.
    ///
    /// On the wire: `FOUND <id> <pri> <n_bytes>` plus body.
    Found { id: u64, pri: u32, body: Bytes },
    /// In response to a `stats`, a YAML report of server-wide counters.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
    /// In response to a `stats <id>`, a YAML report for one job.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
}

#[derive(Debug, PartialEq, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// job state
    pub state: JobState,
    /// time in seconds since creation
    pub age: u64,
    /// delay in seconds set by put or release
    pub delay: u32,
    /// allowed processing time in seconds
    pub ttr: u32,
    /// seconds until the job becomes ready (delayed) or until its
    /// reservation expires (reserved)
    #[serde(rename = "time-left")]
    pub time_left: u64,
    /// number of times the job's reservation timed out
    pub timeouts: u64,
    /// number of times the job was released
    pub releases: u64,
    /// number of times the job was buried
    pub buries: u64,
    /// number of times the job was kicked
    pub kicks: u64,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready queue
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,

    /// number of put commands
    #[serde(rename = "cmd-put")]
    pub cmd_put: u64,
    /// number of peek commands, with or without an ID
    #[serde(rename = "cmd-peek")]
    pub cmd_peek: u64,
    /// number of reserve commands
    #[serde(rename = "cmd-reserve")]
    pub cmd_reserve: u64,
    /// number of delete commands
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of release commands
    #[serde(rename = "cmd-release")]
    pub cmd_release: u64,
    /// number of bury commands
    #[serde(rename = "cmd-bury")]
    pub cmd_bury: u64,
    /// number of kick commands
    #[serde(rename = "cmd-kick")]
    pub cmd_kick: u64,
    /// number of stats commands, with or without an ID
    #[serde(rename = "cmd-stats")]
    pub cmd_stats: u64,

    /// cumulative count of reservations that timed out
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// maximum number of bytes in a job body
    #[serde(rename = "max-job-size")]
    pub max_job_size: u64,
    /// entry capacity of each priority heap
    #[serde(rename = "heap-size")]
    pub heap_size: u64,

    /// number of currently open connections
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    /// number of open connections that have issued at least one put
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    /// number of open connections that have issued at least one reserve
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    /// number of connections blocked in a reserve
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// cumulative count of connections
    #[serde(rename = "total-connections")]
    pub total_connections: u64,

    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
    /// cumulative user CPU time of this process in seconds
    #[serde(rename = "rusage-utime")]
    pub rusage_utime: f64,
    /// cumulative system CPU time of this process in seconds
    #[serde(rename = "rusage-stime")]
    pub rusage_stime: f64,
    /// number of seconds since this server process started running
    pub uptime: u64,

    /// whether the server is refusing new jobs
    pub draining: bool,
}
