use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    NotAuthenticated,
    NoRobots,
    Cloud { cmd: String, result: String },
    Protocol(String),
    Bus(String),
    InvalidTime(String),
    ScheduleConflict(String),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::NotAuthenticated => write!(f, "not authenticated"),
            Error::NoRobots => write!(f, "no robots registered to this account"),
            Error::Cloud { cmd, result } => write!(f, "cloud rejected {cmd}: {result}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Bus(msg) => write!(f, "bus error: {msg}"),
            Error::InvalidTime(v) => write!(f, "invalid start time {v:?}, expected HH:MM or empty"),
            Error::ScheduleConflict(msg) => write!(f, "schedule conflict: {msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
