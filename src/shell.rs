//! Interactive shell and the command bus to the dispatcher thread
//!
//! The shell never touches the environment directly. Each line travels over
//! a channel to the dispatcher, which owns the `EnvironmentManager`, and the
//! shell waits for the rendered reply before prompting again.

use crate::commands::{parse_command, ShellCommand};
use crate::help::shell_help;
use crate::manager::EnvironmentManager;
use crate::signal;
use crate::storage::PopulationStore;
use crate::supervisor::AgentLauncher;
use crossbeam::channel::{self, Receiver, Sender};
use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const BANNER: &str = "*** circle-of-life shell ready - type help ***";

#[derive(Debug)]
pub struct Request {
    pub line: String,
    pub reply: Sender<Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// The environment has drained; the shell should exit.
    Quit,
}

/// Why the shell loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    Quit,
    EndOfInput,
    DispatcherGone,
}

enum Dispatch {
    Reply(String),
    Quit,
}

fn dispatch<S, L>(manager: &EnvironmentManager<S, L>, line: &str) -> Dispatch
where
    S: PopulationStore + 'static,
    L: AgentLauncher,
{
    match parse_command(line) {
        Ok(ShellCommand::Run {
            action,
            target,
            count,
        }) => Dispatch::Reply(manager.execute(action, target, count)),
        Ok(ShellCommand::Help) => Dispatch::Reply(shell_help()),
        Ok(ShellCommand::Empty) => Dispatch::Reply(String::new()),
        Ok(ShellCommand::Quit) => Dispatch::Quit,
        Err(err) => {
            debug!(line = line.trim_end(), error = %err, "command rejected");
            Dispatch::Reply(format!("***{err}"))
        }
    }
}

/// Move the manager onto its own thread and return the bus that feeds it.
/// A quit request drains the environment before it is acknowledged.
pub fn spawn_dispatcher<S, L>(
    manager: EnvironmentManager<S, L>,
) -> io::Result<(Sender<Request>, JoinHandle<()>)>
where
    S: PopulationStore + 'static,
    L: AgentLauncher + 'static,
{
    let (bus, requests) = channel::unbounded::<Request>();
    let handle = thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || serve(manager, requests))?;
    Ok((bus, handle))
}

fn serve<S, L>(manager: EnvironmentManager<S, L>, requests: Receiver<Request>)
where
    S: PopulationStore + 'static,
    L: AgentLauncher,
{
    for request in requests.iter() {
        match dispatch(&manager, &request.line) {
            Dispatch::Reply(text) => {
                let _ = request.reply.send(Reply::Text(text));
            }
            Dispatch::Quit => {
                if let Err(err) = manager.shutdown() {
                    error!(error = %err, "drain failed");
                }
                let _ = request.reply.send(Reply::Quit);
                return;
            }
        }
    }
    // every sender gone: the manager drains as it drops
}

/// Send one line and wait for its reply.
pub fn submit(bus: &Sender<Request>, line: impl Into<String>) -> Option<Reply> {
    let (reply, replies) = channel::bounded(1);
    bus.send(Request {
        line: line.into(),
        reply,
    })
    .ok()?;
    replies.recv().ok()
}

/// Ask the dispatcher to drain and wait up to `timeout` for the
/// acknowledgement. Returns whether it arrived.
pub fn request_drain(bus: &Sender<Request>, timeout: Duration) -> bool {
    let (reply, replies) = channel::bounded(1);
    if bus
        .send(Request {
            line: "quit".to_string(),
            reply,
        })
        .is_err()
    {
        return false;
    }
    match replies.recv_timeout(timeout) {
        Ok(Reply::Quit) => true,
        Ok(Reply::Text(_)) => false,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "drain not acknowledged");
            false
        }
    }
}

/// Prompt loop. Returns on a quit command, end of input or a vanished
/// dispatcher; the caller decides how to tear down.
pub fn run_shell<R, W>(mut input: R, mut output: W, bus: &Sender<Request>) -> io::Result<ShellExit>
where
    R: BufRead,
    W: Write,
{
    writeln!(output, "{BANNER}")?;
    loop {
        write!(output, "> ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(ShellExit::EndOfInput);
        }

        match submit(bus, line) {
            Some(Reply::Text(text)) => {
                if !text.is_empty() {
                    writeln!(output, "{text}")?;
                }
            }
            Some(Reply::Quit) => {
                writeln!(output, "Exiting...")?;
                return Ok(ShellExit::Quit);
            }
            None => return Ok(ShellExit::DispatcherGone),
        }
    }
}

/// Watch for SIGINT/SIGTERM, drain and exit the process.
pub fn spawn_signal_watcher(bus: Sender<Request>, ack_timeout: Duration) -> io::Result<()> {
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || loop {
            if signal::shutdown_requested() {
                println!("\nExiting...");
                let acknowledged = request_drain(&bus, ack_timeout);
                debug!(acknowledged, "drain after signal");
                std::process::exit(130);
            }
            thread::sleep(Duration::from_millis(100));
        })?;
    Ok(())
}
