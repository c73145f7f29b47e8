//! Out-of-band playback command channel.
//!
//! Commands arrive as single bytes on a separate input stream and steer the
//! caller's playback loop (pause, fast-forward, skip, quit). While data is
//! being sent on a TCP sink the channel is multiplexed with the write using
//! a poll(2)-style readiness wait, so neither side can starve the other.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use log::{debug, warn};

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::Error;

/// A playback steering command, decoded from one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Normal,
    Pause,
    Fast,
    FastFast,
    Reverse,
    FastReverse,
    SkipForward,
    SkipBackward,
    SkipForwardLots,
    SkipBackwardLots,
    SelectFile(u8),
}

impl Command {
    /// Decode a command byte. Newlines and unrecognized bytes yield None.
    pub fn from_byte(byte: u8) -> Option<Command> {
        match byte {
            b'q' => Some(Command::Quit),
            b'n' => Some(Command::Normal),
            b'p' => Some(Command::Pause),
            b'f' => Some(Command::Fast),
            b'F' => Some(Command::FastFast),
            b'r' => Some(Command::Reverse),
            b'R' => Some(Command::FastReverse),
            b'>' => Some(Command::SkipForward),
            b'<' => Some(Command::SkipBackward),
            b']' => Some(Command::SkipForwardLots),
            b'[' => Some(Command::SkipBackwardLots),
            b'0'..=b'9' => Some(Command::SelectFile(byte - b'0')),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Quit => b'q',
            Command::Normal => b'n',
            Command::Pause => b'p',
            Command::Fast => b'f',
            Command::FastFast => b'F',
            Command::Reverse => b'r',
            Command::FastReverse => b'R',
            Command::SkipForward => b'>',
            Command::SkipBackward => b'<',
            Command::SkipForwardLots => b']',
            Command::SkipBackwardLots => b'[',
            Command::SelectFile(n) => b'0' + n,
        }
    }

    /// Atomic commands hold off further command delivery until the caller
    /// releases them, so a long skip cannot be preempted mid-way.
    pub fn is_atomic(self) -> bool {
        matches!(self, Command::SkipForwardLots | Command::SkipBackwardLots)
    }
}

/// Latest command plus its "changed" flag and the atomic guard, shared
/// between the channel reader and the playback loop. Lock-free; the raw
/// command byte is the stored representation (0 = nothing received yet).
pub struct CommandState {
    latest: AtomicU8,
    changed: AtomicBool,
    atomic: AtomicBool,
}

impl CommandState {
    pub fn new() -> Self {
        Self {
            latest: AtomicU8::new(0),
            changed: AtomicBool::new(false),
            atomic: AtomicBool::new(false),
        }
    }

    /// Record a freshly read command. Atomic commands raise the guard.
    pub fn post(&self, cmd: Command) {
        self.latest.store(cmd.to_byte(), Ordering::SeqCst);
        if cmd.is_atomic() {
            self.atomic.store(true, Ordering::SeqCst);
        }
        self.changed.store(true, Ordering::SeqCst);
    }

    /// The most recently received command, if any.
    pub fn command(&self) -> Option<Command> {
        Command::from_byte(self.latest.load(Ordering::SeqCst))
    }

    /// True when a new command is waiting and no atomic command holds the
    /// guard.
    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst) && !self.atomic.load(Ordering::SeqCst)
    }

    /// The unmasked flag; gates further channel reads until the caller
    /// acknowledges the pending command.
    pub(crate) fn raw_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Acknowledge the pending command.
    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    /// Raise or release the atomic guard.
    pub fn set_atomic(&self, on: bool) {
        self.atomic.store(on, Ordering::SeqCst);
    }

    pub fn quit_requested(&self) -> bool {
        self.command() == Some(Command::Quit)
    }
}

impl Default for CommandState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
type RawConn = std::os::unix::io::RawFd;
#[cfg(windows)]
type RawConn = std::os::windows::io::RawSocket;

/// Anything commands can be read from: a socket, a pipe, a terminal.
#[cfg(unix)]
pub trait CommandSource: Read + std::os::unix::io::AsRawFd + Send {}
#[cfg(unix)]
impl<T: Read + std::os::unix::io::AsRawFd + Send> CommandSource for T {}

#[cfg(windows)]
pub trait CommandSource: Read + std::os::windows::io::AsRawSocket + Send {}
#[cfg(windows)]
impl<T: Read + std::os::windows::io::AsRawSocket + Send> CommandSource for T {}

#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

/// Multiplexes one-byte command reads with non-blocking TCP sends.
pub struct CommandMux {
    source: Box<dyn CommandSource>,
    eof: bool,
}

impl CommandMux {
    pub fn new(source: Box<dyn CommandSource>) -> Self {
        Self { source, eof: false }
    }

    #[cfg(unix)]
    fn source_raw(&self) -> RawConn {
        use std::os::unix::io::AsRawFd;
        self.source.as_raw_fd()
    }

    #[cfg(windows)]
    fn source_raw(&self) -> RawConn {
        use std::os::windows::io::AsRawSocket;
        self.source.as_raw_socket()
    }

    #[cfg(unix)]
    fn sink_raw(sock: &TcpStream) -> RawConn {
        use std::os::unix::io::AsRawFd;
        sock.as_raw_fd()
    }

    #[cfg(windows)]
    fn sink_raw(sock: &TcpStream) -> RawConn {
        use std::os::windows::io::AsRawSocket;
        sock.as_raw_socket()
    }

    /// Write all of `data` to the non-blocking socket, servicing the command
    /// channel whenever it has a byte for us. A pending unacknowledged
    /// command suspends further reads so it cannot be overwritten.
    pub fn send(
        &mut self,
        sock: &mut TcpStream,
        data: &[u8],
        state: &CommandState,
    ) -> Result<(), Error> {
        let mut sent = 0;
        while sent < data.len() {
            let want_read = !self.eof && !state.raw_changed();
            let cmd_raw = want_read.then(|| self.source_raw());
            let ready = wait_ready(cmd_raw, Self::sink_raw(sock)).map_err(Error::Poll)?;

            if ready.readable {
                self.read_command(state);
            }
            if ready.writable {
                match sock.write(&data[sent..]) {
                    Ok(0) => {
                        return Err(Error::SinkWrite(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        )))
                    }
                    Ok(n) => sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::SinkWrite(e)),
                }
            }
        }
        Ok(())
    }

    /// Read and decode exactly one command byte. EOF or a read error is
    /// coerced into a synthetic Quit; the channel is dead afterwards.
    fn read_command(&mut self, state: &CommandState) {
        let mut byte = [0u8; 1];
        match self.source.read(&mut byte) {
            Ok(0) => {
                warn!("command channel closed, synthesizing quit");
                state.post(Command::Quit);
                self.eof = true;
            }
            Ok(_) => {
                if let Some(cmd) = Command::from_byte(byte[0]) {
                    debug!("command received: {:?}", cmd);
                    state.post(cmd);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("command channel read failed ({e}), synthesizing quit");
                state.post(Command::Quit);
                self.eof = true;
            }
        }
    }
}

/// Wait until the command source is readable or the sink is writable.
/// Level-triggered; both flags may come back set in one call.
#[cfg(unix)]
fn wait_ready(cmd: Option<RawConn>, sink: RawConn) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: cmd.unwrap_or(sink),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: sink,
            events: libc::POLLOUT,
            revents: 0,
        },
    ];
    let (offset, count) = if cmd.is_some() { (0, 2) } else { (1, 1) };

    loop {
        let rc = unsafe { libc::poll(fds[offset..].as_mut_ptr(), count as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc > 0 {
            break;
        }
    }

    let hangup = libc::POLLHUP | libc::POLLERR;
    Ok(Readiness {
        readable: cmd.is_some() && fds[0].revents & (libc::POLLIN | hangup) != 0,
        writable: fds[1].revents & (libc::POLLOUT | hangup) != 0,
    })
}

#[cfg(windows)]
fn wait_ready(cmd: Option<RawConn>, sink: RawConn) -> io::Result<Readiness> {
    use windows_sys::Win32::Networking::WinSock::{
        WSAPoll, POLLERR, POLLHUP, POLLRDNORM, POLLWRNORM, SOCKET_ERROR, WSAPOLLFD,
    };

    let mut fds = [
        WSAPOLLFD {
            fd: cmd.unwrap_or(sink) as usize,
            events: POLLRDNORM,
            revents: 0,
        },
        WSAPOLLFD {
            fd: sink as usize,
            events: POLLWRNORM,
            revents: 0,
        },
    ];
    let (offset, count) = if cmd.is_some() { (0, 2) } else { (1, 1) };

    let rc = unsafe { WSAPoll(fds[offset..].as_mut_ptr(), count as u32, -1) };
    if rc == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }

    let hangup = POLLHUP | POLLERR;
    Ok(Readiness {
        readable: cmd.is_some() && fds[0].revents & (POLLRDNORM | hangup) != 0,
        writable: fds[1].revents & (POLLWRNORM | hangup) != 0,
    })
}
