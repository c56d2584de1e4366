mod args;

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use futures::future;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio::{select, signal};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use hayloft::types::heap;
use hayloft::types::server::{ConnId, Server};
use hayloft::wire::events::ClientEvent;
use hayloft::wire::protocol::Response;
use hayloft::wire::{self, decoder};

const EXIT_USAGE: u8 = 5;
const EXIT_FATAL_INIT: u8 = 111;

/// Messages from connection and signal tasks to the core actor. All queue
/// state lives behind this channel, so commands take effect one at a time.
enum CoreMsg {
    /// A connection opened; `tx` is its reply port.
    Attach {
        conn: ConnId,
        tx: mpsc::UnboundedSender<Response>,
    },
    /// One decoded unit of client input.
    Event { conn: ConnId, evt: ClientEvent },
    /// A connection closed; its reservations go back to the ready queue.
    Detach { conn: ConnId },
    /// SIGUSR1 arrived: refuse new jobs from now on.
    Drain,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion,
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        },
        Err(err) => {
            // Usage errors go to stderr and exit 5.
            eprint!("{err}");
            return ExitCode::from(EXIT_USAGE);
        },
    };

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let (core_tx, core_rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut usr1 = match unix_signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(error) => {
                error!(%error, "failed to install SIGUSR1 handler");
                return ExitCode::from(EXIT_FATAL_INIT);
            },
        };

        let core_tx = core_tx.clone();
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                info!("received SIGUSR1, entering drain mode");
                if core_tx.send(CoreMsg::Drain).is_err() {
                    break;
                }
            }
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(EXIT_FATAL_INIT);
        },
    };

    let server =
        Server::new(heap::DEFAULT_CAPACITY, args.max_job_size, Instant::now());
    tokio::spawn(core_loop(server, core_rx));

    match accept_loop(cancel, core_tx, listener, args.max_job_size).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

/// Drives the lifecycle engine: applies messages as they arrive and fires
/// the timer step at the earliest delayed-job or reservation deadline.
async fn core_loop(mut server: Server, mut rx: mpsc::UnboundedReceiver<CoreMsg>) {
    loop {
        let wakeup = server.next_wakeup();
        let timer = async {
            match wakeup {
                Some(at) => time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        select! {
            msg = rx.recv() => match msg {
                Some(CoreMsg::Attach { conn, tx }) => server.attach(conn, tx),
                Some(CoreMsg::Event { conn, evt }) => {
                    server.dispatch(conn, evt, Instant::now())
                },
                Some(CoreMsg::Detach { conn }) => {
                    server.detach(conn, Instant::now())
                },
                Some(CoreMsg::Drain) => server.drain(),
                None => return,
            },
            () = timer => server.tick(Instant::now()),
        }
    }
}

async fn accept_loop(
    cancel: CancellationToken,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    listener: TcpListener,
    max_job_size: u32,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    // Accept incoming connections until an exit signal is sent, and handle
    // each connection as its own task.
    let mut next_conn = 0;
    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                let id = ConnId::new(next_conn);
                next_conn += 1;

                tokio::spawn(do_client_loop(
                    cancel.clone(),
                    core_tx.clone(),
                    id,
                    conn,
                    max_job_size,
                ));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn do_client_loop(
    cancel: CancellationToken,
    core: mpsc::UnboundedSender<CoreMsg>,
    id: ConnId,
    conn: TcpStream,
    max_job_size: u32,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    if core.send(CoreMsg::Attach { conn: id, tx: reply_tx }).is_err() {
        return Err(anyhow!("core task is gone"));
    }

    let mut framed = wire::framed(conn, max_job_size);

    // Full duplex: a blocked reserve is answered through `replies` whenever
    // the matching step runs, so input and output are selected over
    // independently.
    let conn_result = loop {
        select! {
            item = framed.next() => match item {
                None => {
                    debug!("connection dropped");
                    break Ok(());
                },
                Some(Ok(evt)) => {
                    if core.send(CoreMsg::Event { conn: id, evt }).is_err() {
                        break Ok(());
                    }
                },
                Some(Err(decoder::Error::Client(resp))) => {
                    // The stream may be out of sync; reply, then drop the
                    // client.
                    if let Err(error) = framed.send(resp).await {
                        warn!(%error, "failed to send error reply");
                    }

                    break Err(anyhow!(
                        "client sent bad request and was disconnected"
                    ));
                },
                Some(Err(decoder::Error::IO(e))) => break Err(e.into()),
            },
            resp = replies.recv() => match resp {
                Some(resp) => {
                    if let Err(error) = framed.send(resp).await {
                        break Err(error.into());
                    }
                },
                None => break Ok(()),
            },
            _ = cancel.cancelled() => break Ok(()),
        }
    };

    // Whatever the exit path, hand any reservations back to the queue.
    let _ = core.send(CoreMsg::Detach { conn: id });

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    conn_result
}
