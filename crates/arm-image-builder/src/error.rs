use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    /// Invalid build definition, reported before any privileged work starts.
    Config,
    /// The build or flash was interrupted.
    Cancelled,
    /// The user answered "no" to a confirmation prompt.
    Declined,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Other,
            msg: msg.into(),
        }
    }

    // All problems are reported in one go rather than one per run.
    pub fn config(problems: Vec<String>) -> Self {
        let msg = match problems.len() {
            0 => "invalid configuration".to_string(),
            1 => problems[0].clone(),
            n => {
                let mut s = format!("{n} configuration errors:");
                for p in &problems {
                    s.push_str("\n  * ");
                    s.push_str(p);
                }
                s
            }
        };
        Self {
            kind: ErrorKind::Config,
            msg,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            msg: "interrupted".into(),
        }
    }

    pub fn declined<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Declined,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json decode error: {err}"))
    }
}

impl From<crate::mbr::MbrError> for Error {
    fn from(err: crate::mbr::MbrError) -> Self {
        Self::msg(format!("mbr: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
