//! The crate-wide error type. One flat `ErrorKind` enum plus a `message`
//! carries every failure mode; call sites that need a specific reason
//! build one with the `error!` macro rather than defining a new error
//! type per module.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Notify,
    SerdeYaml,
    DomainStr,
    DomainZone,
    Io,
    TSIGFileAlreadyExist,
    TSIGFileNotFound,
    TSIGError,
    Compile,
    Persist,
    ZoneList,
    Xfr,
    Config,
    Utf8,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}", message),
            None => self.kind.fmt(f),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;

        match self {
            Notify => write!(f, "notify error"),
            SerdeYaml => write!(f, "serde yaml error"),
            DomainStr => write!(f, "invalid domain name"),
            DomainZone => write!(f, "domain zone error"),
            Io => write!(f, "io error"),
            TSIGFileAlreadyExist => write!(f, "TSIG file already exists"),
            TSIGFileNotFound => write!(f, "TSIG file not found"),
            TSIGError => write!(f, "TSIG error"),
            Compile => write!(f, "zone compile error"),
            Persist => write!(f, "persistence error"),
            ZoneList => write!(f, "zone list error"),
            Xfr => write!(f, "transfer error"),
            Config => write!(f, "configuration error"),
            Utf8 => write!(f, "invalid utf-8"),
        }
    }
}

/// Builds an [`Error`] with a given kind and formatted message:
/// `error!(Io => "cannot open {}: {}", path, e)`.
#[macro_export]
macro_rules! error {
    ($kind:ident => $($arg:tt)*) => {
        $crate::error::Error {
            kind: $crate::error::ErrorKind::$kind,
            message: Some(format!($($arg)*)),
        }
    };
}

impl From<notify::Error> for Error {
    fn from(value: notify::Error) -> Self {
        Self {
            kind: ErrorKind::Notify,
            message: Some(value.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeYaml,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::name::FromStrError> for Error {
    fn from(value: domain::base::name::FromStrError) -> Self {
        Self {
            kind: ErrorKind::DomainStr,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::zonetree::error::ZoneTreeModificationError> for Error {
    fn from(value: domain::zonetree::error::ZoneTreeModificationError) -> Self {
        Self {
            kind: ErrorKind::DomainZone,
            message: Some(value.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: Some(value.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(value: std::str::Utf8Error) -> Self {
        Self {
            kind: ErrorKind::Utf8,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::tsig::NewKeyError> for Error {
    fn from(value: domain::tsig::NewKeyError) -> Self {
        Self {
            kind: ErrorKind::TSIGError,
            message: Some(value.to_string()),
        }
    }
}
